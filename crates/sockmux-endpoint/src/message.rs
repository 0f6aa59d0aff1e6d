//! One in-flight message and its scratch state.
//!
//! A [`Message`] is either a request pulled off a channel or a synthesized
//! close notification. It owns all per-message scratch data: the inbound
//! payload with its read cursor, the outbound payload being accumulated, and
//! the index tables translating wire references to real handles in both
//! directions. That state belongs exclusively to the thread processing the
//! message and is freed when the message is dropped.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use sockmux_handle::{duplicate, ChannelPair, Credentials, PulledChannel, PulledFd};
use sockmux_wire::{DecodedRequest, IMPULSE_PAYLOAD_SIZE, MAX_MESSAGE_HANDLES};

use crate::error::{EndpointError, Result};
use crate::table::ServiceState;

/// Wire reference to a file handle: non-negative values index the message's
/// file list, negative values are a caller-chosen sentinel.
pub type FileReference = i32;

/// Wire reference to a channel handle.
pub type ChannelReference = i32;

/// Message id shared by all impulses; impulses never receive a reply.
pub const IMPULSE_MESSAGE_ID: i32 = -1;

/// Immutable facts about one message.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub channel_id: i32,
    pub message_id: i32,
    pub op: i32,
    pub credentials: Credentials,
    pub send_len: usize,
    pub recv_len: usize,
    pub fd_count: usize,
    pub impulse_payload: [u8; IMPULSE_PAYLOAD_SIZE],
    pub channel_state: Option<ServiceState>,
}

/// An outbound handle queued for send: either borrowed from the caller (who
/// keeps it alive until the reply is written) or owned by the message.
#[derive(Debug)]
pub(crate) enum OutFd {
    Borrowed(RawFd),
    Owned(OwnedFd),
}

impl OutFd {
    pub fn raw(&self) -> RawFd {
        match self {
            OutFd::Borrowed(fd) => *fd,
            OutFd::Owned(fd) => fd.as_raw_fd(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct OutChannel {
    pub socket: OutFd,
    pub event: OutFd,
}

/// Scratch state for exactly one message.
#[derive(Debug, Default)]
pub(crate) struct MessageState {
    /// Inbound file handles; slots empty out as references are pulled.
    pub request_files: Vec<Option<OwnedFd>>,
    /// Inbound channel handle pairs.
    pub request_channels: Vec<Option<ChannelPair>>,
    pub request_data: Vec<u8>,
    pub read_pos: usize,
    pub response_files: Vec<OutFd>,
    pub response_channels: Vec<OutChannel>,
    pub response_data: Vec<u8>,
    /// Far ends of freshly pushed channels; they stay open only until the
    /// reply carrying their duplicate has been written.
    pub sockets_to_close: Vec<OwnedFd>,
}

impl MessageState {
    pub fn from_request(decoded: DecodedRequest) -> Self {
        Self {
            request_files: decoded.files.into_iter().map(Some).collect(),
            request_channels: decoded.channels.into_iter().map(Some).collect(),
            ..Self::default()
        }
    }

    fn outbound_total(&self) -> usize {
        self.response_files.len() + 2 * self.response_channels.len()
    }

    fn check_outbound_room(&self, adding: usize) -> Result<()> {
        let total = self.outbound_total() + adding;
        if total > MAX_MESSAGE_HANDLES {
            return Err(EndpointError::Wire(sockmux_wire::WireError::TooManyHandles {
                count: total,
                max: MAX_MESSAGE_HANDLES,
            }));
        }
        Ok(())
    }
}

/// One request being processed, or a synthesized close notification.
#[derive(Debug)]
pub struct Message {
    info: MessageInfo,
    state: MessageState,
}

impl Message {
    pub(crate) fn new(info: MessageInfo, state: MessageState) -> Self {
        Self { info, state }
    }

    pub fn channel_id(&self) -> i32 {
        self.info.channel_id
    }

    pub fn message_id(&self) -> i32 {
        self.info.message_id
    }

    pub fn op(&self) -> i32 {
        self.info.op
    }

    /// Kernel-supplied peer identity.
    pub fn credentials(&self) -> Credentials {
        self.info.credentials
    }

    /// Payload length the peer declared.
    pub fn send_len(&self) -> usize {
        self.info.send_len
    }

    /// Maximum reply payload the peer is prepared to receive.
    pub fn recv_len(&self) -> usize {
        self.info.recv_len
    }

    /// Number of file references the request carried.
    pub fn fd_count(&self) -> usize {
        self.info.fd_count
    }

    pub fn is_impulse(&self) -> bool {
        self.info.message_id == IMPULSE_MESSAGE_ID
    }

    pub fn impulse_payload(&self) -> &[u8; IMPULSE_PAYLOAD_SIZE] {
        &self.info.impulse_payload
    }

    /// Service state attached to the originating channel at receive time.
    pub fn channel_state(&self) -> Option<ServiceState> {
        self.info.channel_state.clone()
    }

    /// Copy inbound payload bytes from the read cursor into `buf`, advancing
    /// the cursor. Returns the number of bytes copied.
    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.state.request_data[self.state.read_pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.state.read_pos += n;
        n
    }

    /// Append bytes to the outbound payload. Returns the number appended.
    pub fn write_data(&mut self, bytes: &[u8]) -> usize {
        self.state.response_data.extend_from_slice(bytes);
        bytes.len()
    }

    /// Queue a borrowed descriptor for the reply and return its reference.
    /// The caller must keep the descriptor open until the reply is written.
    pub fn push_file(&mut self, fd: BorrowedFd<'_>) -> Result<FileReference> {
        self.push_file_raw(fd.as_raw_fd())
    }

    /// Queue a duplicate of a descriptor for the reply; the message owns the
    /// duplicate.
    pub fn push_file_dup(&mut self, fd: BorrowedFd<'_>) -> Result<FileReference> {
        self.state.check_outbound_room(1)?;
        let dup = duplicate(fd).map_err(|e| EndpointError::sys("dup", e))?;
        self.state.response_files.push(OutFd::Owned(dup));
        Ok(self.state.response_files.len() as FileReference - 1)
    }

    pub(crate) fn push_file_raw(&mut self, fd: RawFd) -> Result<FileReference> {
        self.state.check_outbound_room(1)?;
        self.state.response_files.push(OutFd::Borrowed(fd));
        Ok(self.state.response_files.len() as FileReference - 1)
    }

    /// Queue a borrowed (socket, event) channel pair for the reply and
    /// return its reference.
    pub fn push_channel_pair(
        &mut self,
        socket: BorrowedFd<'_>,
        event: BorrowedFd<'_>,
    ) -> Result<ChannelReference> {
        self.push_channel_raw(socket.as_raw_fd(), event.as_raw_fd())
    }

    pub(crate) fn push_channel_raw(
        &mut self,
        socket: RawFd,
        event: RawFd,
    ) -> Result<ChannelReference> {
        self.state.check_outbound_room(2)?;
        self.state.response_channels.push(OutChannel {
            socket: OutFd::Borrowed(socket),
            event: OutFd::Borrowed(event),
        });
        Ok(self.state.response_channels.len() as ChannelReference - 1)
    }

    /// Resolve an inbound file reference. Negative references pass through
    /// as a sentinel; non-negative references take ownership of the
    /// descriptor at that index.
    pub fn take_file(&mut self, reference: FileReference) -> Result<PulledFd> {
        if reference < 0 {
            return Ok(PulledFd::Sentinel(reference));
        }
        let available = self.state.request_files.len();
        self.state
            .request_files
            .get_mut(reference as usize)
            .and_then(Option::take)
            .map(PulledFd::Fd)
            .ok_or(EndpointError::BadReference {
                index: reference,
                available,
            })
    }

    /// Resolve an inbound channel reference to its (socket, event) pair.
    pub fn take_channel(&mut self, reference: ChannelReference) -> Result<PulledChannel> {
        if reference < 0 {
            return Ok(PulledChannel::Sentinel(reference));
        }
        let available = self.state.request_channels.len();
        self.state
            .request_channels
            .get_mut(reference as usize)
            .and_then(Option::take)
            .map(PulledChannel::Channel)
            .ok_or(EndpointError::BadReference {
                index: reference,
                available,
            })
    }

    pub(crate) fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use sockmux_handle::stream_pair;
    use sockmux_wire::RequestHeader;

    use super::*;

    fn empty_message(op: i32) -> Message {
        Message::new(
            MessageInfo {
                channel_id: 1,
                message_id: 1,
                op,
                credentials: Credentials::unknown(),
                send_len: 0,
                recv_len: 0,
                fd_count: 0,
                impulse_payload: [0; IMPULSE_PAYLOAD_SIZE],
                channel_state: None,
            },
            MessageState::default(),
        )
    }

    #[test]
    fn read_cursor_advances_and_stops() {
        let mut message = empty_message(1);
        message.state_mut().request_data = b"abcdef".to_vec();

        let mut buf = [0u8; 4];
        assert_eq!(message.read_data(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(message.read_data(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(message.read_data(&mut buf), 0);
    }

    #[test]
    fn write_appends() {
        let mut message = empty_message(1);
        assert_eq!(message.write_data(b"one"), 3);
        assert_eq!(message.write_data(b"-two"), 4);
        assert_eq!(message.state_mut().response_data, b"one-two");
    }

    #[test]
    fn push_file_indexes_sequentially() {
        let (a, b) = stream_pair().unwrap();
        let mut message = empty_message(1);

        assert_eq!(message.push_file(a.as_fd()).unwrap(), 0);
        assert_eq!(message.push_file_dup(b.as_fd()).unwrap(), 1);
        assert_eq!(message.state_mut().response_files.len(), 2);
    }

    #[test]
    fn negative_reference_is_sentinel() {
        let mut message = empty_message(1);
        match message.take_file(-7).unwrap() {
            PulledFd::Sentinel(value) => assert_eq!(value, -7),
            other => panic!("expected sentinel, got {other:?}"),
        }
        match message.take_channel(-1).unwrap() {
            PulledChannel::Sentinel(value) => assert_eq!(value, -1),
            other => panic!("expected sentinel, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_reference_fails() {
        let mut message = empty_message(1);
        let err = message.take_file(0).unwrap_err();
        assert!(matches!(
            err,
            EndpointError::BadReference {
                index: 0,
                available: 0
            }
        ));

        let err = message.take_channel(3).unwrap_err();
        assert!(matches!(err, EndpointError::BadReference { index: 3, .. }));
    }

    #[test]
    fn taking_a_reference_twice_fails() {
        let (a, _b) = stream_pair().unwrap();
        let decoded = DecodedRequest {
            header: RequestHeader::default(),
            credentials: None,
            files: vec![a],
            channels: Vec::new(),
        };
        let mut message = empty_message(1);
        *message.state_mut() = MessageState::from_request(decoded);

        assert!(matches!(
            message.take_file(0).unwrap(),
            PulledFd::Fd(_)
        ));
        assert!(message.take_file(0).is_err());
    }

    #[test]
    fn outbound_handle_limit_enforced() {
        let (a, _b) = stream_pair().unwrap();
        let mut message = empty_message(1);
        for _ in 0..MAX_MESSAGE_HANDLES {
            message.push_file(a.as_fd()).unwrap();
        }
        assert!(message.push_file(a.as_fd()).is_err());
        assert!(message.push_channel_pair(a.as_fd(), a.as_fd()).is_err());
    }
}
