//! One-shot epoll wrapper.
//!
//! Every channel socket and the listening socket are registered one-shot:
//! once a readiness event is delivered, the descriptor produces no further
//! events until explicitly re-armed. This is the mechanism that lets any
//! number of worker threads share one multiplexer without two of them ever
//! observing the same descriptor ready at once. The cancellation eventfd is
//! the one level-triggered registration: once signalled it stays readable,
//! so every subsequent wait observes the shutdown.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

const ONESHOT_EVENTS: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 | libc::EPOLLONESHOT as u32;
const LEVEL_EVENTS: u32 = libc::EPOLLIN as u32;

/// One readiness event pulled from the set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub fd: RawFd,
    /// EPOLLRDHUP or EPOLLHUP was set: the peer is gone, do not read.
    pub hangup: bool,
}

/// A kernel readiness-multiplexing set.
#[derive(Debug)]
pub(crate) struct PollSet {
    epoll: OwnedFd,
}

impl PollSet {
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 has no pointer arguments; a non-negative
        // return is a descriptor this process owns.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Register a descriptor with one-shot readiness tracking.
    pub fn add_oneshot(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd.as_raw_fd(), ONESHOT_EVENTS)
    }

    /// Re-enable a one-shot descriptor after its event has been consumed.
    pub fn rearm(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd.as_raw_fd(), ONESHOT_EVENTS)
    }

    /// Register a level-triggered descriptor (the cancellation eventfd).
    pub fn add_level(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd.as_raw_fd(), LEVEL_EVENTS)
    }

    /// Remove a descriptor from the set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: `event` is a valid epoll_event; a non-null pointer is
        // required even for EPOLL_CTL_DEL on older kernels.
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for exactly one ready event. `Ok(None)` means a non-blocking
    /// poll found nothing.
    pub fn wait_one(&self, blocking: bool) -> io::Result<Option<PollEvent>> {
        // SAFETY: zeroed epoll_event is a valid output slot.
        let mut event: libc::epoll_event = unsafe { mem::zeroed() };
        loop {
            // SAFETY: `event` is a valid writable epoll_event and maxevents
            // is 1, matching the buffer.
            let count = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    &mut event,
                    1,
                    if blocking { -1 } else { 0 },
                )
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if count == 0 {
                return Ok(None);
            }
            let hangup = event.events & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0;
            return Ok(Some(PollEvent {
                fd: event.u64 as RawFd,
                hangup,
            }));
        }
    }
}
