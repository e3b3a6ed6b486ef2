// SPDX-License-Identifier: Apache-2.0 OR MIT
//! TUN endpoint: scoped ownership of the tunnel fd with cancellable reads.
//!
//! The fd lives in an atomic slot that `close` exchanges to −1 before the
//! one kernel close. A reader that already loaded the fd is woken through
//! the cancel event and maps the resulting EBADF/EINTR to `Aborted`; a
//! reader that has not yet started fails fast on the slot. That is the whole
//! use-after-close story — there is no lock around the fd.

use crate::datapath::events::{CancelEvent, EventWaiter};
use crate::datapath::{PacketPipe, TunnelInterface};
use crate::logging::{Facility, Logger};
use crate::packet::Packet;
use crate::status::{DatapathError, Result};
use crate::IpProtocol;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

/// Largest IP packet a single TUN read can produce.
const MAX_PACKET_SIZE: usize = 4096;

const KEEPALIVE_DISABLED: i64 = -1;

pub struct IpSecTunnel {
    tunnel_fd: AtomicI32,
    keepalive_interval_ms: AtomicI64,
    waiter: EventWaiter,
    cancel: CancelEvent,
    logger: Logger,
}

impl IpSecTunnel {
    /// Take ownership of a TUN fd provided by the platform binding and
    /// register it with the endpoint's waiter.
    pub fn create(tunnel_fd: OwnedFd, logger: Logger) -> Result<Self> {
        let waiter = EventWaiter::new()
            .map_err(|e| DatapathError::internal(format!("creating tunnel event waiter: {e}")))?;
        let cancel = CancelEvent::new()
            .map_err(|e| DatapathError::internal(format!("creating tunnel cancel event: {e}")))?;
        waiter.add(tunnel_fd.as_raw_fd()).map_err(|e| {
            DatapathError::internal(format!(
                "registering tunnel fd {}: {e}",
                tunnel_fd.as_raw_fd()
            ))
        })?;
        waiter.add(cancel.fd()).map_err(|e| {
            DatapathError::internal(format!("registering tunnel cancel fd: {e}"))
        })?;
        Ok(Self {
            tunnel_fd: AtomicI32::new(tunnel_fd.into_raw_fd()),
            keepalive_interval_ms: AtomicI64::new(KEEPALIVE_DISABLED),
            waiter,
            cancel,
            logger,
        })
    }

    fn wait_timeout_ms(&self) -> i32 {
        match self.keepalive_interval_ms.load(Ordering::Relaxed) {
            KEEPALIVE_DISABLED => -1,
            ms => ms.min(i32::MAX as i64) as i32,
        }
    }
}

impl PacketPipe for IpSecTunnel {
    fn read_packets(&self) -> Result<Vec<Packet>> {
        let fd = self.tunnel_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(DatapathError::internal("attempted to read on a closed tunnel fd"));
        }

        let event = self.waiter.wait(self.wait_timeout_ms()).map_err(|e| {
            DatapathError::internal(format!("failed to listen for events on fd {fd}: {e}"))
        })?;

        let Some(event) = event else {
            // Keepalive deadline passed with no traffic.
            return Ok(vec![Packet::keepalive()]);
        };

        if event.fd == self.cancel.fd() {
            // Cancelled or closed; an empty vector with Ok is the graceful
            // closed signal. The notification stays set until the owner
            // clears it, so late readers observe it too.
            return Ok(Vec::new());
        }

        if event.error {
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
                        "reading from tunnel fd {fd}"
                    )));
                }
            };
            if read_bytes == 0 {
                return Err(DatapathError::aborted(format!("tunnel fd {fd} returned EOF")));
            }
            buffer.truncate(read_bytes);
            return Ok(vec![Packet::new(buffer, IpProtocol::Unknown)]);
        }

        Err(DatapathError::internal(format!(
            "unexpected event on fd {fd}: {event:?}"
        )))
    }

    fn write_packets(&self, packets: Vec<Packet>) -> Result<()> {
        let fd = self.tunnel_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(DatapathError::internal("attempted to write to a closed tunnel fd"));
        }
        for packet in &packets {
            let data = packet.data();
            let written = loop {
                let rc =
                    unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(DatapathError::internal(format!(
                        "error writing to tunnel fd {fd}: {err}"
                    )));
                }
            };
            if written != data.len() {
                return Err(DatapathError::internal(format!(
                    "short write to tunnel fd {fd}: {written} of {} bytes",
                    data.len()
                )));
            }
        }
        Ok(())
    }
}

impl TunnelInterface for IpSecTunnel {
    fn set_keepalive_interval(&self, interval: Option<Duration>) {
        let ms = match interval {
            Some(interval) if !interval.is_zero() => {
                interval.as_millis().min(i64::MAX as u128) as i64
            }
            _ => KEEPALIVE_DISABLED,
        };
        self.keepalive_interval_ms.store(ms, Ordering::Relaxed);
        self.logger.info(
            Facility::Tunnel,
            &match ms {
                KEEPALIVE_DISABLED => "keepalive disabled".to_string(),
                ms => format!("keepalive interval set to {ms} ms"),
            },
        );
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        match self.keepalive_interval_ms.load(Ordering::Relaxed) {
            KEEPALIVE_DISABLED => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    fn is_keepalive_enabled(&self) -> bool {
        self.keepalive_interval_ms.load(Ordering::Relaxed) != KEEPALIVE_DISABLED
    }

    fn cancel_read_packets(&self) -> Result<()> {
        self.cancel
            .notify()
            .map_err(|e| DatapathError::internal(format!("notifying tunnel cancel event: {e}")))
    }

    fn clear_read_cancellation(&self) {
        self.cancel.clear();
    }

    fn close(&self) -> Result<()> {
        let fd = self.tunnel_fd.swap(-1, Ordering::SeqCst);
        if fd < 0 {
            self.logger.warning(
                Facility::Tunnel,
                "attempted to close tunnel that was already closed",
            );
            return Ok(());
        }
        self.logger
            .info(Facility::Tunnel, &format!("closing tunnel fd={fd}"));
        if let Err(e) = self.waiter.remove(fd) {
            self.logger.error(
                Facility::Tunnel,
                &format!("removing tunnel fd {fd} from waiter: {e}"),
            );
        }
        unsafe { libc::close(fd) };
        // Wake any in-flight reader so it observes the closure.
        if let Err(e) = self.cancel.notify() {
            self.logger.error(
                Facility::Tunnel,
                &format!("notifying close on tunnel fd {fd}: {e}"),
            );
        }
        Ok(())
    }
}

impl Drop for IpSecTunnel {
    fn drop(&mut self) {
        if self.tunnel_fd.load(Ordering::SeqCst) >= 0 {
            let _ = TunnelInterface::close(self);
        }
    }
}
