use bytes::{BufMut, BytesMut};

use crate::error::{Result, WireError};

/// Magic bytes: "SX" (0x53 0x58).
pub const MAGIC: [u8; 2] = [0x53, 0x58];

/// Header kind byte for requests.
pub const KIND_REQUEST: u8 = 1;
/// Header kind byte for responses.
pub const KIND_RESPONSE: u8 = 2;

/// Size of the fixed inline impulse payload.
pub const IMPULSE_PAYLOAD_SIZE: usize = 32;

/// Request header: magic (2) + kind (1) + flags (1) + op (4) + send_len (4)
/// + max_recv_len (4) + fd_count (2) + channel_count (2) + impulse (32).
pub const REQUEST_HEADER_SIZE: usize = 52;

/// Response header: magic (2) + kind (1) + reserved (1) + ret_code (4)
/// + recv_len (4) + fd_count (2) + channel_count (2).
pub const RESPONSE_HEADER_SIZE: usize = 16;

/// Maximum descriptors one message may carry in ancillary data, counting
/// both bare file references and the two descriptors of each channel
/// reference. Stays well under the kernel's SCM_RIGHTS limit of 253.
pub const MAX_MESSAGE_HANDLES: usize = 64;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const FLAG_IMPULSE: u8 = 0x01;

/// The fixed-format header opening every request.
///
/// Peer credentials deliberately have no bytes here: they are supplied by
/// the kernel out-of-band and must never be trusted from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Service-defined operation code.
    pub op: i32,
    /// Number of payload bytes following the header.
    pub send_len: u32,
    /// Maximum reply payload the client is prepared to receive.
    pub max_recv_len: u32,
    /// Fire-and-forget request: no payload follows, no reply is sent.
    pub is_impulse: bool,
    /// Inline payload for impulse requests.
    pub impulse_payload: [u8; IMPULSE_PAYLOAD_SIZE],
    /// Number of file references in the ancillary descriptor array.
    pub fd_count: u16,
    /// Number of channel references (two descriptors each) following the
    /// file references in the ancillary descriptor array.
    pub channel_count: u16,
}

impl Default for RequestHeader {
    fn default() -> Self {
        Self {
            op: 0,
            send_len: 0,
            max_recv_len: 0,
            is_impulse: false,
            impulse_payload: [0; IMPULSE_PAYLOAD_SIZE],
            fd_count: 0,
            channel_count: 0,
        }
    }
}

impl RequestHeader {
    /// Total descriptors this header declares in ancillary data.
    pub fn handle_total(&self) -> usize {
        self.fd_count as usize + 2 * self.channel_count as usize
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        check_handle_total(self.fd_count, self.channel_count)?;
        dst.reserve(REQUEST_HEADER_SIZE);
        dst.put_slice(&MAGIC);
        dst.put_u8(KIND_REQUEST);
        dst.put_u8(if self.is_impulse { FLAG_IMPULSE } else { 0 });
        dst.put_i32_le(self.op);
        dst.put_u32_le(self.send_len);
        dst.put_u32_le(self.max_recv_len);
        dst.put_u16_le(self.fd_count);
        dst.put_u16_le(self.channel_count);
        dst.put_slice(&self.impulse_payload);
        Ok(())
    }

    /// Decode from the fixed wire layout, validating magic, kind, and
    /// declared handle counts.
    pub fn decode(src: &[u8; REQUEST_HEADER_SIZE]) -> Result<Self> {
        if src[0..2] != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        if src[2] != KIND_REQUEST {
            return Err(WireError::UnexpectedKind {
                expected: KIND_REQUEST,
                found: src[2],
            });
        }
        let fd_count = u16::from_le_bytes(src[16..18].try_into().unwrap());
        let channel_count = u16::from_le_bytes(src[18..20].try_into().unwrap());
        check_handle_total(fd_count, channel_count)?;

        let mut impulse_payload = [0u8; IMPULSE_PAYLOAD_SIZE];
        impulse_payload.copy_from_slice(&src[20..52]);

        Ok(Self {
            op: i32::from_le_bytes(src[4..8].try_into().unwrap()),
            send_len: u32::from_le_bytes(src[8..12].try_into().unwrap()),
            max_recv_len: u32::from_le_bytes(src[12..16].try_into().unwrap()),
            is_impulse: src[3] & FLAG_IMPULSE != 0,
            impulse_payload,
            fd_count,
            channel_count,
        })
    }
}

/// The fixed-format header opening every response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Service return code; negative values are errno-style failures.
    pub ret_code: i32,
    /// Number of reply payload bytes following the header.
    pub recv_len: u32,
    /// Number of file references in the ancillary descriptor array.
    pub fd_count: u16,
    /// Number of channel references following the file references.
    pub channel_count: u16,
}

impl ResponseHeader {
    /// Total descriptors this header declares in ancillary data.
    pub fn handle_total(&self) -> usize {
        self.fd_count as usize + 2 * self.channel_count as usize
    }

    /// Encode into the fixed wire layout.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        check_handle_total(self.fd_count, self.channel_count)?;
        dst.reserve(RESPONSE_HEADER_SIZE);
        dst.put_slice(&MAGIC);
        dst.put_u8(KIND_RESPONSE);
        dst.put_u8(0);
        dst.put_i32_le(self.ret_code);
        dst.put_u32_le(self.recv_len);
        dst.put_u16_le(self.fd_count);
        dst.put_u16_le(self.channel_count);
        Ok(())
    }

    /// Decode from the fixed wire layout.
    pub fn decode(src: &[u8; RESPONSE_HEADER_SIZE]) -> Result<Self> {
        if src[0..2] != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        if src[2] != KIND_RESPONSE {
            return Err(WireError::UnexpectedKind {
                expected: KIND_RESPONSE,
                found: src[2],
            });
        }
        let fd_count = u16::from_le_bytes(src[12..14].try_into().unwrap());
        let channel_count = u16::from_le_bytes(src[14..16].try_into().unwrap());
        check_handle_total(fd_count, channel_count)?;

        Ok(Self {
            ret_code: i32::from_le_bytes(src[4..8].try_into().unwrap()),
            recv_len: u32::from_le_bytes(src[8..12].try_into().unwrap()),
            fd_count,
            channel_count,
        })
    }
}

fn check_handle_total(fd_count: u16, channel_count: u16) -> Result<()> {
    let total = fd_count as usize + 2 * channel_count as usize;
    if total > MAX_MESSAGE_HANDLES {
        return Err(WireError::TooManyHandles {
            count: total,
            max: MAX_MESSAGE_HANDLES,
        });
    }
    Ok(())
}
