//! Multi-channel Unix-socket endpoint with one-shot epoll dispatch.
//!
//! An [`Endpoint`] accepts connections on one Unix domain socket, tracks
//! each as a *channel* keyed by a stable integer id, and multiplexes
//! readiness across every channel plus a cancellation signal through one
//! epoll set. Worker threads pull complete [`Message`]s with
//! [`Endpoint::wait`] and answer them with [`Endpoint::reply`]; one-shot
//! readiness registration guarantees each channel is handled by at most one
//! worker at a time, without per-channel locks.
//!
//! Descriptors and nested channels cross the wire as index-based references
//! resolved against per-message handle tables (see `sockmux-wire`).

pub mod endpoint;
pub mod error;
pub mod message;
mod poll;
pub mod table;

pub use endpoint::Endpoint;
pub use error::{EndpointError, Result};
pub use message::{
    ChannelReference, FileReference, Message, MessageInfo, IMPULSE_MESSAGE_ID,
};
pub use table::ServiceState;

/// Reserved opcodes interpreted by the transport itself.
pub mod opcodes {
    /// First request on a new channel; the reply carries the channel's
    /// event handle instead of application payload.
    pub const CHANNEL_OPEN: i32 = -1;

    /// Synthesized locally when a peer disconnects; never sent by a peer.
    /// Replying to it tears the channel down without writing to the wire.
    pub const CHANNEL_CLOSE: i32 = -2;
}
