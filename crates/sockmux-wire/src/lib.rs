//! Length-prefixed request/response wire protocol with out-of-band handle
//! passing.
//!
//! Every message is a fixed-format header (magic, kind, lengths, handle
//! counts) followed by exactly the declared payload bytes. Descriptors never
//! appear in the byte stream: the header carries index-based *references*,
//! and the real descriptors ride along as SCM_RIGHTS ancillary data —
//! file-reference descriptors first, then a (socket, event) pair for each
//! channel reference. Peer credentials come from the kernel (SCM_CREDENTIALS
//! or SO_PEERCRED), never from the peer's own bytes.

pub mod error;
pub mod header;
pub mod io;

pub use error::{Result, WireError};
pub use header::{
    RequestHeader, ResponseHeader, DEFAULT_MAX_PAYLOAD, IMPULSE_PAYLOAD_SIZE, KIND_REQUEST,
    KIND_RESPONSE, MAGIC, MAX_MESSAGE_HANDLES, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};
pub use io::{recv_exact, recv_exact_with_fds, send_all, send_with_fds, AncillaryIn};

use bytes::BytesMut;
use sockmux_handle::{BorrowedFd, ChannelPair, Credentials, OwnedFd, RawFd};
use tracing::trace;

/// A fully received request header plus its out-of-band handles.
///
/// The payload is *not* read here; impulse handling decides whether payload
/// bytes follow at all.
#[derive(Debug)]
pub struct DecodedRequest {
    pub header: RequestHeader,
    /// Kernel-supplied peer identity, when the socket has SO_PASSCRED set.
    pub credentials: Option<Credentials>,
    /// File-reference descriptors, indexed by the wire references.
    pub files: Vec<OwnedFd>,
    /// Channel-reference descriptor pairs, indexed by the wire references.
    pub channels: Vec<ChannelPair>,
}

/// A fully received response, payload included.
#[derive(Debug)]
pub struct DecodedResponse {
    pub header: ResponseHeader,
    pub files: Vec<OwnedFd>,
    pub channels: Vec<ChannelPair>,
    pub payload: Vec<u8>,
}

/// Send a request: header with attached descriptors, then the payload.
///
/// `send_len` and the handle counts are derived from the arguments, not
/// taken from `header`.
pub fn send_request(
    socket: BorrowedFd<'_>,
    header: &RequestHeader,
    payload: &[u8],
    files: &[RawFd],
    channels: &[(RawFd, RawFd)],
) -> Result<()> {
    if payload.len() > DEFAULT_MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: DEFAULT_MAX_PAYLOAD,
        });
    }
    let mut header = header.clone();
    header.send_len = payload.len() as u32;
    header.fd_count = files.len() as u16;
    header.channel_count = channels.len() as u16;

    let mut wire = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
    header.encode(&mut wire)?;

    let fds = flatten_handles(files, channels);
    send_with_fds(socket, &wire, &fds)?;
    if !payload.is_empty() {
        send_all(socket, payload)?;
    }
    Ok(())
}

/// Receive one request header and its out-of-band handles.
pub fn recv_request(socket: BorrowedFd<'_>) -> Result<DecodedRequest> {
    let mut buf = [0u8; REQUEST_HEADER_SIZE];
    let ancillary = recv_exact_with_fds(socket, &mut buf)?;
    let header = RequestHeader::decode(&buf)?;
    if header.send_len as usize > DEFAULT_MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            size: header.send_len as usize,
            max: DEFAULT_MAX_PAYLOAD,
        });
    }
    trace!(
        op = header.op,
        send_len = header.send_len,
        impulse = header.is_impulse,
        handles = ancillary.fds.len(),
        "received request header"
    );
    let (files, channels) = split_handles(ancillary.fds, header.fd_count, header.channel_count)?;
    Ok(DecodedRequest {
        header,
        credentials: ancillary.credentials,
        files,
        channels,
    })
}

/// Send a response: header with attached descriptors, then the payload.
pub fn send_response(
    socket: BorrowedFd<'_>,
    ret_code: i32,
    payload: &[u8],
    files: &[RawFd],
    channels: &[(RawFd, RawFd)],
) -> Result<()> {
    if payload.len() > DEFAULT_MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: DEFAULT_MAX_PAYLOAD,
        });
    }
    let header = ResponseHeader {
        ret_code,
        recv_len: payload.len() as u32,
        fd_count: files.len() as u16,
        channel_count: channels.len() as u16,
    };

    let mut wire = BytesMut::with_capacity(RESPONSE_HEADER_SIZE);
    header.encode(&mut wire)?;

    let fds = flatten_handles(files, channels);
    send_with_fds(socket, &wire, &fds)?;
    if !payload.is_empty() {
        send_all(socket, payload)?;
    }
    Ok(())
}

/// Receive one complete response, payload included.
pub fn recv_response(socket: BorrowedFd<'_>) -> Result<DecodedResponse> {
    let mut buf = [0u8; RESPONSE_HEADER_SIZE];
    let ancillary = recv_exact_with_fds(socket, &mut buf)?;
    let header = ResponseHeader::decode(&buf)?;
    if header.recv_len as usize > DEFAULT_MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            size: header.recv_len as usize,
            max: DEFAULT_MAX_PAYLOAD,
        });
    }
    trace!(
        ret_code = header.ret_code,
        recv_len = header.recv_len,
        handles = ancillary.fds.len(),
        "received response header"
    );
    let (files, channels) = split_handles(ancillary.fds, header.fd_count, header.channel_count)?;

    let mut payload = vec![0u8; header.recv_len as usize];
    if !payload.is_empty() {
        recv_exact(socket, &mut payload)?;
    }
    Ok(DecodedResponse {
        header,
        files,
        channels,
        payload,
    })
}

fn flatten_handles(files: &[RawFd], channels: &[(RawFd, RawFd)]) -> Vec<RawFd> {
    let mut fds = Vec::with_capacity(files.len() + 2 * channels.len());
    fds.extend_from_slice(files);
    for &(socket, event) in channels {
        fds.push(socket);
        fds.push(event);
    }
    fds
}

fn split_handles(
    fds: Vec<OwnedFd>,
    fd_count: u16,
    channel_count: u16,
) -> Result<(Vec<OwnedFd>, Vec<ChannelPair>)> {
    let declared = fd_count as usize + 2 * channel_count as usize;
    if fds.len() != declared {
        return Err(WireError::HandleCountMismatch {
            declared,
            got: fds.len(),
        });
    }
    let mut iter = fds.into_iter();
    let files: Vec<OwnedFd> = iter.by_ref().take(fd_count as usize).collect();
    let mut channels = Vec::with_capacity(channel_count as usize);
    while let (Some(socket), Some(event)) = (iter.next(), iter.next()) {
        channels.push(ChannelPair { socket, event });
    }
    Ok((files, channels))
}
