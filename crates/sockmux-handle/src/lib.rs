//! Kernel handle ownership primitives.
//!
//! Every descriptor crossing a sockmux API boundary is expressed through one
//! of three capabilities:
//! - [`OwnedFd`] — exclusive ownership, closed exactly once on drop,
//! - [`BorrowedFd`] — a non-owning view that must not outlive the owner,
//! - [`duplicate`] — a fresh owned descriptor referring to the same kernel
//!   object.
//!
//! This is the lowest layer of sockmux. It also hosts the small set of
//! kernel-object constructors the endpoint needs (eventfds, connected socket
//! pairs) and the credential-passing socket options.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd};

pub use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

/// Peer identity as reported by the kernel, never by the peer's own bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Peer process id.
    pub pid: i32,
    /// Peer effective user id.
    pub uid: u32,
    /// Peer effective group id.
    pub gid: u32,
}

impl Credentials {
    /// Placeholder identity for messages the transport synthesizes itself
    /// (close notifications have no peer to attribute).
    pub fn unknown() -> Self {
        Self {
            pid: -1,
            uid: u32::MAX,
            gid: u32::MAX,
        }
    }
}

/// The two descriptors making up one channel capability: the data socket and
/// the companion event-notification handle.
#[derive(Debug)]
pub struct ChannelPair {
    pub socket: OwnedFd,
    pub event: OwnedFd,
}

/// Result of resolving a file reference pulled off the wire.
///
/// Negative reference values are a caller-chosen sentinel and pass through
/// verbatim; non-negative values resolve to a real descriptor.
#[derive(Debug)]
pub enum PulledFd {
    Fd(OwnedFd),
    Sentinel(i32),
}

impl PulledFd {
    /// Returns the owned descriptor, if the reference resolved to one.
    pub fn into_fd(self) -> Option<OwnedFd> {
        match self {
            PulledFd::Fd(fd) => Some(fd),
            PulledFd::Sentinel(_) => None,
        }
    }
}

/// Result of resolving a channel reference pulled off the wire.
#[derive(Debug)]
pub enum PulledChannel {
    Channel(ChannelPair),
    Sentinel(i32),
}

impl PulledChannel {
    /// Returns the owned channel pair, if the reference resolved to one.
    pub fn into_pair(self) -> Option<ChannelPair> {
        match self {
            PulledChannel::Channel(pair) => Some(pair),
            PulledChannel::Sentinel(_) => None,
        }
    }
}

/// Duplicate a borrowed descriptor into a new owned one referring to the
/// same kernel object. The duplicate is close-on-exec.
pub fn duplicate(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}

/// Create a non-blocking, close-on-exec eventfd with an initial count of 0.
pub fn eventfd() -> io::Result<OwnedFd> {
    // SAFETY: eventfd has no pointer arguments; a non-negative return is a
    // freshly created descriptor this process owns.
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a connected AF_UNIX stream socket pair, both ends close-on-exec.
pub fn stream_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid writable array of two ints; on success the
    // kernel hands us two descriptors this process owns.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded, so both fds are open and unowned.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Enable SO_PASSCRED on a Unix socket so the kernel attaches the peer's
/// credentials as ancillary data.
pub fn set_passcred(fd: BorrowedFd<'_>) -> io::Result<()> {
    let optval: libc::c_int = 1;
    // SAFETY: `optval` is a valid c_int for the duration of the call and
    // `fd` is an open socket descriptor.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&optval as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Query the connected peer's credentials via SO_PEERCRED.
pub fn peer_credentials(fd: BorrowedFd<'_>) -> io::Result<Credentials> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: `cred` and `len` are valid writable pointers for the provided
    // sizes, and `fd` is an open Unix socket descriptor owned by the caller.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
        Ok(Credentials {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        })
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Add 1 to an eventfd's counter, waking any poller watching it.
pub fn signal_event(fd: BorrowedFd<'_>) -> io::Result<()> {
    let value: u64 = 1;
    // SAFETY: writes exactly 8 bytes from a valid u64 to an open eventfd.
    let rc = unsafe {
        libc::write(
            fd.as_raw_fd(),
            (&value as *const u64).cast::<libc::c_void>(),
            std::mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reset an eventfd's counter to 0. A counter already at 0 is not an error.
pub fn drain_event(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut value: u64 = 0;
    // SAFETY: reads at most 8 bytes into a valid u64 from an open eventfd.
    let rc = unsafe {
        libc::read(
            fd.as_raw_fd(),
            (&mut value as *mut u64).cast::<libc::c_void>(),
            std::mem::size_of::<u64>(),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // The eventfd is non-blocking; empty means nothing to drain.
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}
