// SPDX-License-Identifier: Apache-2.0 OR MIT
//! UDP endpoint toward the egress node.
//!
//! Mirrors the tunnel's atomic-fd/cancel discipline without the keepalive
//! timer. The fd arrives from the platform already bound to a specific host
//! network; `connect` pins the destination so writes can use send(2).
//!
//! A read failing with EPERM means the platform revoked the network this
//! protected socket was bound to; the forwarder turns that into a permanent
//! failure instead of a transient one.

use crate::datapath::events::{CancelEvent, EventWaiter};
use crate::datapath::{PacketPipe, SocketInterface};
use crate::logging::{Facility, Logger};
use crate::packet::Packet;
use crate::status::{DatapathError, Result};
use crate::{Endpoint, IpProtocol};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

const MAX_PACKET_SIZE: usize = 4096;

pub struct DatagramSocket {
    socket_fd: AtomicI32,
    connected: AtomicBool,
    waiter: EventWaiter,
    cancel: CancelEvent,
    logger: Logger,
}

impl DatagramSocket {
    /// Take ownership of a UDP fd provided by the platform binding.
    pub fn create(socket_fd: OwnedFd, logger: Logger) -> Result<Self> {
        let waiter = EventWaiter::new()
            .map_err(|e| DatapathError::internal(format!("creating socket event waiter: {e}")))?;
        let cancel = CancelEvent::new()
            .map_err(|e| DatapathError::internal(format!("creating socket cancel event: {e}")))?;
        waiter.add(socket_fd.as_raw_fd()).map_err(|e| {
            DatapathError::internal(format!(
                "registering socket fd {}: {e}",
                socket_fd.as_raw_fd()
            ))
        })?;
        waiter
            .add(cancel.fd())
            .map_err(|e| DatapathError::internal(format!("registering socket cancel fd: {e}")))?;
        Ok(Self {
            socket_fd: AtomicI32::new(socket_fd.into_raw_fd()),
            connected: AtomicBool::new(false),
            waiter,
            cancel,
            logger,
        })
    }
}

impl PacketPipe for DatagramSocket {
    fn read_packets(&self) -> Result<Vec<Packet>> {
        let fd = self.socket_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(DatapathError::internal("attempted to read on a closed socket fd"));
        }

        let event = self.waiter.wait(-1).map_err(|e| {
            DatapathError::internal(format!("failed to listen for events on fd {fd}: {e}"))
        })?;

        let Some(event) = event else {
            // No timeout was armed; epoll cannot time out here.
            return Err(DatapathError::internal(format!(
                "unexpected timeout waiting on fd {fd}"
            )));
        };

        if event.fd == self.cancel.fd() {
            return Ok(Vec::new());
        }

        if event.error {
            // Fetch the pending socket error so EPERM on a revoked network
            // is distinguishable from a generic failure.
            let mut so_error: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut so_error as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc == 0 && so_error != 0 {
                return Err(DatapathError::aborted_errno(
                    format!(
                        "socket fd {fd} failed: {}",
                        std::io::Error::from_raw_os_error(so_error)
                    ),
                    so_error,
                ));
            }
            return Err(DatapathError::internal(format!("read event on fd {fd} failed")));
        }

        if event.readable || event.hangup {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];
            let read_bytes = loop {
                let rc = unsafe {
                    libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, MAX_PACKET_SIZE)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(DatapathError::aborted_from_os(&format!(
                        "reading from socket fd {fd}"
                    )));
                }
            };
            if read_bytes == 0 {
                // A bare shutdown(2) from outside lands here.
                return Err(DatapathError::aborted(format!("socket fd {fd} was shut down")));
            }
            buffer.truncate(read_bytes);
            return Ok(vec![Packet::new(buffer, IpProtocol::Unknown)]);
        }

        Err(DatapathError::internal(format!(
            "unexpected event on fd {fd}: {event:?}"
        )))
    }

    fn write_packets(&self, packets: Vec<Packet>) -> Result<()> {
        let fd = self.socket_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(DatapathError::internal("attempted to write to a closed socket fd"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DatapathError::internal(format!(
                "attempted to write to socket fd {fd} before connect"
            )));
        }
        for packet in &packets {
            let data = packet.data();
            let sent = loop {
                let rc = unsafe {
                    libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), 0)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(DatapathError::internal(format!(
                        "error sending on socket fd {fd}: {err}"
                    )));
                }
            };
            if sent != data.len() {
                return Err(DatapathError::internal(format!(
                    "short send on socket fd {fd}: {sent} of {} bytes",
                    data.len()
                )));
            }
        }
        Ok(())
    }
}

impl SocketInterface for DatagramSocket {
    fn connect(&self, dest: &Endpoint) -> Result<()> {
        let fd = self.socket_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(DatapathError::internal("attempted to connect a closed socket fd"));
        }
        let addr = dest.socket_addr()?;
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        socket2::SockRef::from(&borrowed)
            .connect(&addr.into())
            .map_err(|e| {
                DatapathError::internal(format!("connecting socket fd {fd} to {dest}: {e}"))
            })?;
        self.connected.store(true, Ordering::SeqCst);
        self.logger
            .info(Facility::NetworkSocket, &format!("socket fd {fd} connected to {dest}"));
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.socket_fd.load(Ordering::SeqCst)
    }

    fn cancel_read_packets(&self) -> Result<()> {
        self.cancel
            .notify()
            .map_err(|e| DatapathError::internal(format!("notifying socket cancel event: {e}")))
    }

    fn close(&self) -> Result<()> {
        let fd = self.socket_fd.swap(-1, Ordering::SeqCst);
        if fd < 0 {
            self.logger.warning(
                Facility::NetworkSocket,
                "attempted to close socket that was already closed",
            );
            return Ok(());
        }
        self.logger
            .info(Facility::NetworkSocket, &format!("closing socket fd={fd}"));
        if let Err(e) = self.waiter.remove(fd) {
            self.logger.error(
                Facility::NetworkSocket,
                &format!("removing socket fd {fd} from waiter: {e}"),
            );
        }
        unsafe { libc::close(fd) };
        if let Err(e) = self.cancel.notify() {
            self.logger.error(
                Facility::NetworkSocket,
                &format!("notifying close on socket fd {fd}: {e}"),
            );
        }
        Ok(())
    }

    fn debug_string(&self) -> String {
        format!(
            "DatagramSocket{{fd={}, connected={}}}",
            self.socket_fd.load(Ordering::SeqCst),
            self.connected.load(Ordering::SeqCst)
        )
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        if self.socket_fd.load(Ordering::SeqCst) >= 0 {
            let _ = SocketInterface::close(self);
        }
    }
}
