//! Ancillary-data socket I/O.
//!
//! Descriptors travel as SCM_RIGHTS control messages attached to the first
//! byte of a header; peer credentials arrive as SCM_CREDENTIALS when the
//! receiving socket has SO_PASSCRED enabled. Everything here is a direct
//! blocking syscall with EINTR retry; there is no buffering layer.

use std::io::{self, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use sockmux_handle::Credentials;

use crate::error::{Result, WireError};
use crate::header::MAX_MESSAGE_HANDLES;

/// Out-of-band data collected while receiving a header.
#[derive(Debug, Default)]
pub struct AncillaryIn {
    /// Descriptors delivered via SCM_RIGHTS, in wire order.
    pub fds: Vec<OwnedFd>,
    /// Peer credentials delivered via SCM_CREDENTIALS, when present.
    pub credentials: Option<Credentials>,
}

/// Send `bytes` in full, attaching `fds` as SCM_RIGHTS to the first chunk.
pub fn send_with_fds(socket: BorrowedFd<'_>, bytes: &[u8], fds: &[RawFd]) -> Result<()> {
    debug_assert!(!bytes.is_empty());
    if fds.is_empty() {
        return send_all(socket, bytes);
    }
    if fds.len() > MAX_MESSAGE_HANDLES {
        return Err(WireError::TooManyHandles {
            count: fds.len(),
            max: MAX_MESSAGE_HANDLES,
        });
    }

    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space =
        unsafe { libc::CMSG_SPACE((fds.len() * mem::size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut offset = 0usize;
    let mut ancillary_sent = false;
    while offset < bytes.len() {
        let mut iov = libc::iovec {
            iov_base: bytes[offset..].as_ptr() as *mut libc::c_void,
            iov_len: bytes.len() - offset,
        };
        // SAFETY: a zeroed msghdr is a valid "no iov, no control" header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !ancillary_sent {
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = cmsg_buf.len() as _;
            // SAFETY: msg_control points at cmsg_buf, which is large enough
            // for one SCM_RIGHTS message carrying `fds.len()` descriptors.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len =
                    libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as _;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    fds.len(),
                );
            }
        }

        // SAFETY: msg and its iov/control pointers are valid for this call.
        let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if sent < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(WireError::Io(err));
        }
        if sent == 0 {
            return Err(WireError::PeerClosed);
        }
        ancillary_sent = true;
        offset += sent as usize;
    }
    Ok(())
}

/// Receive exactly `buf.len()` bytes, collecting any ancillary descriptors
/// and credentials delivered along the way.
///
/// EOF before the first byte is a clean shutdown ([`WireError::PeerClosed`]);
/// EOF after partial data is a protocol failure ([`WireError::Truncated`]).
pub fn recv_exact_with_fds(socket: BorrowedFd<'_>, buf: &mut [u8]) -> Result<AncillaryIn> {
    // Room for one SCM_RIGHTS block at the handle limit plus credentials.
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe {
        libc::CMSG_SPACE((MAX_MESSAGE_HANDLES * mem::size_of::<RawFd>()) as u32)
            + libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32)
    } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut ancillary = AncillaryIn::default();
    let mut received = 0usize;
    while received < buf.len() {
        let mut iov = libc::iovec {
            iov_base: buf[received..].as_mut_ptr().cast(),
            iov_len: buf.len() - received,
        };
        // SAFETY: a zeroed msghdr is a valid "no iov, no control" header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_buf.len() as _;

        // SAFETY: msg and its iov/control pointers are valid for this call.
        let got = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if got < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(WireError::Io(err));
        }
        if got == 0 {
            if received == 0 {
                return Err(WireError::PeerClosed);
            }
            return Err(WireError::Truncated {
                expected: buf.len(),
                got: received,
            });
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(WireError::AncillaryTruncated);
        }
        collect_ancillary(&msg, &mut ancillary);
        if ancillary.fds.len() > MAX_MESSAGE_HANDLES {
            return Err(WireError::TooManyHandles {
                count: ancillary.fds.len(),
                max: MAX_MESSAGE_HANDLES,
            });
        }
        received += got as usize;
    }
    Ok(ancillary)
}

fn collect_ancillary(msg: &libc::msghdr, ancillary: &mut AncillaryIn) {
    // SAFETY: walks the cmsg chain inside the control buffer attached to
    // `msg`; the kernel guarantees cmsg_len stays within msg_controllen
    // when MSG_CTRUNC is not set (checked by the caller).
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET {
                match (*cmsg).cmsg_type {
                    libc::SCM_RIGHTS => {
                        let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                        let count = data_len / mem::size_of::<RawFd>();
                        let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                        for i in 0..count {
                            let raw = std::ptr::read_unaligned(data.add(i));
                            ancillary.fds.push(OwnedFd::from_raw_fd(raw));
                        }
                    }
                    libc::SCM_CREDENTIALS => {
                        let mut cred: libc::ucred = mem::zeroed();
                        std::ptr::copy_nonoverlapping(
                            libc::CMSG_DATA(cmsg),
                            (&mut cred as *mut libc::ucred).cast::<u8>(),
                            mem::size_of::<libc::ucred>(),
                        );
                        ancillary.credentials = Some(Credentials {
                            pid: cred.pid,
                            uid: cred.uid,
                            gid: cred.gid,
                        });
                    }
                    _ => {}
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
}

/// Send `bytes` in full, retrying short writes and EINTR.
pub fn send_all(socket: BorrowedFd<'_>, bytes: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        // SAFETY: the pointer/length pair describes live bytes of `bytes`.
        let sent = unsafe {
            libc::send(
                socket.as_raw_fd(),
                bytes[offset..].as_ptr().cast(),
                bytes.len() - offset,
                libc::MSG_NOSIGNAL,
            )
        };
        if sent < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(WireError::Io(err));
        }
        if sent == 0 {
            return Err(WireError::PeerClosed);
        }
        offset += sent as usize;
    }
    Ok(())
}

/// Receive exactly `buf.len()` bytes. Any EOF is a truncation: this is only
/// used for payload bytes a header already promised.
pub fn recv_exact(socket: BorrowedFd<'_>, buf: &mut [u8]) -> Result<()> {
    let mut received = 0usize;
    while received < buf.len() {
        // SAFETY: the pointer/length pair describes writable bytes of `buf`.
        let got = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                buf[received..].as_mut_ptr().cast(),
                buf.len() - received,
                0,
            )
        };
        if got < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(WireError::Io(err));
        }
        if got == 0 {
            return Err(WireError::Truncated {
                expected: buf.len(),
                got: received,
            });
        }
        received += got as usize;
    }
    Ok(())
}
