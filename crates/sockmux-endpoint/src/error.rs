use std::io;
use std::path::PathBuf;

use sockmux_wire::WireError;

/// Errors surfaced by endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The channel id is not present in the table.
    #[error("unknown channel id {0}")]
    UnknownChannel(i32),

    /// A non-negative reference does not index into the message's handle list.
    #[error("reference {index} out of range ({available} available)")]
    BadReference { index: i32, available: usize },

    /// The channel's socket is missing at reply time.
    #[error("no socket for channel {0} at reply time")]
    BadChannelSocket(i32),

    /// A non-blocking wait found no work. Expected outcome, not a failure.
    #[error("no events ready")]
    Timeout,

    /// The endpoint has been cancelled and is being torn down.
    #[error("endpoint cancelled")]
    Shutdown,

    /// Failed to bind the listening socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: io::Error,
    },

    /// The inherited listener was not handed to this process.
    #[error("inherited listener {name:?} not available: {reason}")]
    InheritedListener { name: String, reason: &'static str },

    /// A wire protocol failure on a channel socket.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// A syscall failed.
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        source: io::Error,
    },
}

impl EndpointError {
    pub(crate) fn sys(op: &'static str, source: io::Error) -> Self {
        Self::Sys { op, source }
    }
}

pub type Result<T> = std::result::Result<T, EndpointError>;
