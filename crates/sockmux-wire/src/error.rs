/// Errors that can occur while encoding, decoding, or transferring messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The header does not start with the expected magic bytes.
    #[error("invalid header magic (expected 0x5358 \"SX\")")]
    InvalidMagic,

    /// The header kind byte does not match the expected message direction.
    #[error("unexpected header kind {found} (expected {expected})")]
    UnexpectedKind { expected: u8, found: u8 },

    /// The message declares more handles than one message may carry.
    #[error("too many handles ({count}, max {max})")]
    TooManyHandles { count: usize, max: usize },

    /// The declared payload exceeds the maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer closed the connection cleanly, before any part of a message.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The peer closed the connection in the middle of a message.
    #[error("stream truncated ({got} of {expected} bytes)")]
    Truncated { expected: usize, got: usize },

    /// The kernel delivered a different number of descriptors than the
    /// header declared.
    #[error("ancillary data carried {got} descriptors, header declared {declared}")]
    HandleCountMismatch { declared: usize, got: usize },

    /// The kernel truncated the ancillary data (control buffer too small).
    #[error("ancillary data truncated")]
    AncillaryTruncated,

    /// An I/O error occurred on the socket.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
