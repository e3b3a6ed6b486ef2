// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Readiness multiplexing for the blocking endpoint reads.
//!
//! Each endpoint owns one [`EventWaiter`] (an epoll instance) registering its
//! data fd plus a [`CancelEvent`]. A read blocks in `wait`; anything that
//! needs to interrupt it — `Close`, an explicit cancellation, a keepalive
//! deadline — comes back as a wait outcome rather than a signal.
//!
//! Cancellation is sticky: `notify` leaves the eventfd readable until
//! `clear` drains it, so a reader that was not yet parked still observes the
//! cancellation on its next wait.

use nix::sys::eventfd::{EfdFlags, EventFd};
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Readiness report for a single fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Multiplexes readiness across a small set of fds with a millisecond
/// timeout. Used by exactly one reader thread per endpoint.
pub struct EventWaiter {
    epoll: OwnedFd,
}

impl EventWaiter {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Register `fd` for readability (level-triggered).
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut event,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deregister `fd`. Removing an fd that was never added is a no-op.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Block until one registered fd is ready or the timeout expires.
    /// `timeout_ms` of −1 waits forever. `Ok(None)` is a timeout.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Option<ReadyEvent>> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        loop {
            let rc =
                unsafe { libc::epoll_wait(self.epoll.as_raw_fd(), &mut event, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                return Ok(None);
            }
            let flags = event.events;
            return Ok(Some(ReadyEvent {
                fd: event.u64 as RawFd,
                readable: flags & libc::EPOLLIN as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0,
                hangup: flags & libc::EPOLLHUP as u32 != 0,
            }));
        }
    }
}

/// Side-channel that makes a blocked `wait` return. Backed by an eventfd; a
/// notified event stays readable until cleared.
pub struct CancelEvent {
    event: EventFd,
}

impl CancelEvent {
    pub fn new() -> io::Result<Self> {
        let event = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
        )
        .map_err(io::Error::from)?;
        Ok(Self { event })
    }

    pub fn fd(&self) -> RawFd {
        self.event.as_fd().as_raw_fd()
    }

    /// Make the event readable. EAGAIN means the counter is already at its
    /// limit, which for our purposes is the same as notified.
    pub fn notify(&self) -> io::Result<()> {
        let value: u64 = 1;
        let bytes = value.to_ne_bytes();
        loop {
            let rc = unsafe {
                libc::write(
                    self.fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            if rc == bytes.len() as isize {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    /// Drain the event so the next `wait` blocks again.
    pub fn clear(&self) {
        let mut buf = [0u8; 8];
        loop {
            let rc = unsafe { libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if rc >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // EAGAIN: nothing pending
            return;
        }
    }
}
