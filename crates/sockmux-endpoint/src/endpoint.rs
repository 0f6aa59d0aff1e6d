//! The endpoint: one listening socket, one cancellation signal, one epoll
//! set, and the channel table — multiplexing any number of connections
//! across any number of worker threads.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sockmux_handle::{
    drain_event, eventfd, peer_credentials, set_passcred, signal_event, stream_pair, Credentials,
};
use sockmux_wire::{recv_exact, recv_request, send_response, WireError, IMPULSE_PAYLOAD_SIZE};
use tracing::{debug, error, info};

use crate::error::{EndpointError, Result};
use crate::message::{ChannelReference, Message, MessageInfo, MessageState, IMPULSE_MESSAGE_ID};
use crate::opcodes;
use crate::poll::PollSet;
use crate::table::{ChannelData, ChannelTable, ServiceState};

/// Pending-connection backlog on the listening socket. One request is
/// in flight per channel, and accepts are serviced promptly off the epoll
/// set, so the backlog stays minimal.
const SOCKET_BACKLOG: libc::c_int = 1;

/// Default permission mode for created socket paths.
const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// First descriptor passed by the service manager, after stdio.
const INHERITED_FD_START: RawFd = 3;

/// A socket path this endpoint created and should remove on drop.
#[derive(Debug)]
struct BoundPath {
    path: PathBuf,
    dev_ino: (u64, u64),
}

/// The listening/dispatch object. One per logical service.
///
/// All methods take `&self`; an `Endpoint` is shared across a worker pool
/// (for example behind an `Arc`) with every worker calling [`Endpoint::wait`]
/// concurrently. One-shot readiness registration guarantees no two workers
/// ever observe the same channel ready at once.
#[derive(Debug)]
pub struct Endpoint {
    listener: OwnedFd,
    bound: Option<BoundPath>,
    cancel_event: OwnedFd,
    poll: PollSet,
    blocking: bool,
    table: Mutex<ChannelTable>,
    next_message_id: AtomicI32,
}

impl Endpoint {
    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If a stale socket file exists at `path` it is removed first; an
    /// existing non-socket file is refused. The created socket file is
    /// restricted to mode 0600.
    pub fn bind(path: impl AsRef<Path>, blocking: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| EndpointError::Bind {
                path: path.clone(),
                source: e,
            })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| EndpointError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(EndpointError::Bind {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| EndpointError::Bind {
            path: path.clone(),
            source: e,
        })?;
        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(DEFAULT_SOCKET_MODE),
        )
        .map_err(|e| EndpointError::Bind {
            path: path.clone(),
            source: e,
        })?;

        // Shrink the kernel backlog to the endpoint's one-in-flight model.
        // SAFETY: the listener fd is open; listen on a listening socket
        // just updates the backlog.
        let rc = unsafe { libc::listen(listener.as_raw_fd(), SOCKET_BACKLOG) };
        if rc != 0 {
            return Err(EndpointError::sys("listen", std::io::Error::last_os_error()));
        }

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| EndpointError::Bind {
            path: path.clone(),
            source: e,
        })?;
        let bound = BoundPath {
            dev_ino: (metadata.dev(), metadata.ino()),
            path: path.clone(),
        };

        info!(?path, "listening on unix domain socket");
        Self::from_parts(listener.into(), Some(bound), blocking)
    }

    /// Adopt a listening socket inherited from the service manager, located
    /// by name through the `LISTEN_FDS`/`LISTEN_FDNAMES` convention.
    pub fn from_inherited(name: &str, blocking: bool) -> Result<Self> {
        let err = |reason| EndpointError::InheritedListener {
            name: name.to_string(),
            reason,
        };

        let pid: u32 = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or(err("LISTEN_PID not set"))?;
        if pid != std::process::id() {
            return Err(err("LISTEN_PID names another process"));
        }
        let count: usize = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or(err("LISTEN_FDS not set"))?;
        let names = std::env::var("LISTEN_FDNAMES").map_err(|_| err("LISTEN_FDNAMES not set"))?;
        let index = names
            .split(':')
            .position(|n| n == name)
            .ok_or(err("no such listener name"))?;
        if index >= count {
            return Err(err("name index exceeds LISTEN_FDS"));
        }

        let raw = INHERITED_FD_START + index as RawFd;
        // SAFETY: by the inheritance convention this descriptor was passed
        // to us open and unowned; we take exclusive ownership here.
        let listener = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: sets the close-on-exec flag on a descriptor we own.
        unsafe {
            libc::fcntl(listener.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        }
        info!(name, fd = raw, "adopted inherited listener");
        Self::from_parts(listener, None, blocking)
    }

    /// Wrap an already-listening socket.
    pub fn from_listener(listener: OwnedFd, blocking: bool) -> Result<Self> {
        Self::from_parts(listener, None, blocking)
    }

    fn from_parts(listener: OwnedFd, bound: Option<BoundPath>, blocking: bool) -> Result<Self> {
        let cancel_event = eventfd().map_err(|e| EndpointError::sys("eventfd", e))?;
        let poll = PollSet::new().map_err(|e| EndpointError::sys("epoll_create1", e))?;
        poll.add_oneshot(listener.as_fd())
            .map_err(|e| EndpointError::sys("epoll_ctl", e))?;
        poll.add_level(cancel_event.as_fd())
            .map_err(|e| EndpointError::sys("epoll_ctl", e))?;
        Ok(Self {
            listener,
            bound,
            cancel_event,
            poll,
            blocking,
            table: Mutex::new(ChannelTable::new()),
            next_message_id: AtomicI32::new(1),
        })
    }

    /// Whether [`Endpoint::wait`] blocks for work or polls once.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.table().len()
    }

    /// Wait for and return one message: a request from some channel, or a
    /// synthesized close notification.
    ///
    /// Errors: [`EndpointError::Timeout`] when a non-blocking endpoint finds
    /// no work, [`EndpointError::Shutdown`] once [`Endpoint::cancel`] has
    /// been called, and channel/system failures otherwise. Any number of
    /// threads may call this concurrently on one endpoint.
    pub fn wait(&self) -> Result<Message> {
        let event = self
            .poll
            .wait_one(self.blocking)
            .map_err(|e| EndpointError::sys("epoll_wait", e))?
            .ok_or(EndpointError::Timeout)?;

        if event.fd == self.cancel_event.as_raw_fd() {
            return Err(EndpointError::Shutdown);
        }

        if event.fd == self.listener.as_raw_fd() {
            let result = self.accept_connection();
            // Re-arm the listener whether or not the accept worked; a failed
            // accept must not wedge the endpoint for future connections.
            if let Err(e) = self.poll.rearm(self.listener.as_fd()) {
                error!(error = %e, "failed to re-arm listening socket");
                if result.is_ok() {
                    return Err(EndpointError::sys("epoll_ctl", e));
                }
            }
            return result;
        }

        if event.hangup {
            // Peer is gone; synthesize a close without touching the socket.
            let channel_id = self.table().id_for_fd(event.fd).unwrap_or(-1);
            return Ok(self.build_close_message(channel_id));
        }

        self.receive_message_for(event.fd)
    }

    /// Signal cancellation: every blocked or future [`Endpoint::wait`] call
    /// observes [`EndpointError::Shutdown`] from now on.
    pub fn cancel(&self) -> Result<()> {
        signal_event(self.cancel_event.as_fd()).map_err(|e| EndpointError::sys("eventfd write", e))
    }

    fn accept_connection(&self) -> Result<Message> {
        // SAFETY: the listener fd is open; null address pointers are
        // allowed when the peer address is not wanted.
        let raw = unsafe {
            libc::accept4(
                self.listener.as_raw_fd(),
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if raw < 0 {
            let e = std::io::Error::last_os_error();
            error!(error = %e, "failed to accept connection");
            return Err(EndpointError::sys("accept4", e));
        }
        // SAFETY: accept4 succeeded, so `raw` is open and unowned.
        let socket = unsafe { OwnedFd::from_raw_fd(raw) };

        set_passcred(socket.as_fd()).map_err(|e| EndpointError::sys("setsockopt", e))?;
        let credentials = peer_credentials(socket.as_fd()).unwrap_or_else(|e| {
            error!(error = %e, "failed to read peer credentials");
            Credentials::unknown()
        });

        let socket_raw = socket.as_raw_fd();
        let channel_id = self.register_channel(socket, credentials, None)?;
        debug!(channel_id, "accepted connection");

        // The client queues its first request immediately after connecting;
        // read it now (or synthesize a close if the client is already gone).
        self.receive_message_for(socket_raw)
    }

    /// Install a socket as a new channel: epoll registration plus both table
    /// map entries, all under the table lock.
    fn register_channel(
        &self,
        socket: OwnedFd,
        credentials: Credentials,
        state: Option<ServiceState>,
    ) -> Result<i32> {
        let event = eventfd().map_err(|e| EndpointError::sys("eventfd", e))?;
        let mut table = self.table();
        self.poll
            .add_oneshot(socket.as_fd())
            .map_err(|e| EndpointError::sys("epoll_ctl", e))?;
        let channel_id = table.insert(ChannelData {
            socket,
            event,
            credentials,
            state,
            pending_events: 0,
        });
        Ok(channel_id)
    }

    /// Remove a channel: epoll deregistration and both table map entries.
    /// The maps are cleaned up even if deregistration fails.
    pub fn close_channel(&self, channel_id: i32) -> Result<()> {
        let mut table = self.table();
        let data = table
            .remove(channel_id)
            .ok_or(EndpointError::UnknownChannel(channel_id))?;
        let result = self.poll.delete(data.socket.as_raw_fd());
        drop(table);
        debug!(channel_id, "closed channel");
        if let Err(e) = result {
            error!(channel_id, error = %e, "failed to deregister channel socket");
            return Err(EndpointError::sys("epoll_ctl", e));
        }
        Ok(())
    }

    /// Update a channel's signalled readiness mask. Raising the first bits
    /// signals the channel's event handle; clearing the last drains it.
    pub fn modify_channel_events(
        &self,
        channel_id: i32,
        clear_mask: u32,
        set_mask: u32,
    ) -> Result<()> {
        let mut table = self.table();
        let data = table
            .get_mut(channel_id)
            .ok_or(EndpointError::UnknownChannel(channel_id))?;
        let old = data.pending_events;
        data.pending_events = (old & !clear_mask) | set_mask;
        if old == 0 && data.pending_events != 0 {
            signal_event(data.event.as_fd()).map_err(|e| EndpointError::sys("eventfd write", e))?;
        } else if old != 0 && data.pending_events == 0 {
            drain_event(data.event.as_fd()).map_err(|e| EndpointError::sys("eventfd read", e))?;
        }
        Ok(())
    }

    /// Attach opaque service state to an existing channel.
    pub fn set_channel_state(&self, channel_id: i32, state: ServiceState) -> Result<()> {
        let mut table = self.table();
        let data = table
            .get_mut(channel_id)
            .ok_or(EndpointError::UnknownChannel(channel_id))?;
        data.state = Some(state);
        Ok(())
    }

    /// Service state attached to a channel, if any.
    pub fn channel_state(&self, channel_id: i32) -> Option<ServiceState> {
        self.table().get(channel_id).and_then(|d| d.state.clone())
    }

    /// Duplicate of a channel's event handle, if the channel exists.
    pub fn channel_event(&self, channel_id: i32) -> Option<OwnedFd> {
        let table = self.table();
        let data = table.get(channel_id)?;
        sockmux_handle::duplicate(data.event.as_fd()).ok()
    }

    /// Reverse lookup from a channel's socket to its id.
    pub fn channel_id_for_socket(&self, socket: BorrowedFd<'_>) -> Option<i32> {
        self.table().id_for_fd(socket.as_raw_fd())
    }

    /// Send the reply for a message and re-arm its channel.
    ///
    /// `CHANNEL_CLOSE` closes the channel without writing anything.
    /// `CHANNEL_OPEN` with a negative code closes the channel; with a
    /// non-negative code it discards any queued payload and replies with
    /// the channel's event handle, using that reference as the return code.
    pub fn reply(&self, message: &mut Message, return_code: i32) -> Result<()> {
        let channel_id = message.channel_id();
        let socket_raw = self
            .channel_socket_raw(channel_id)
            .ok_or(EndpointError::BadChannelSocket(channel_id))?;

        match message.op() {
            opcodes::CHANNEL_CLOSE => return self.close_channel(channel_id),
            opcodes::CHANNEL_OPEN if return_code < 0 => return self.close_channel(channel_id),
            _ => {}
        }

        let mut return_code = return_code;
        if message.op() == opcodes::CHANNEL_OPEN {
            let event_raw = self
                .channel_event_raw(channel_id)
                .ok_or(EndpointError::UnknownChannel(channel_id))?;
            message.state_mut().response_data.clear();
            return_code = message.push_file_raw(event_raw)?;
        }

        // SAFETY: the table entry looked up above keeps this socket open,
        // and the one-shot discipline means no other worker is using it.
        let socket = unsafe { BorrowedFd::borrow_raw(socket_raw) };

        let state = message.state_mut();
        let files: Vec<RawFd> = state.response_files.iter().map(|f| f.raw()).collect();
        let channels: Vec<(RawFd, RawFd)> = state
            .response_channels
            .iter()
            .map(|c| (c.socket.raw(), c.event.raw()))
            .collect();

        if let Err(err) = send_response(socket, return_code, &state.response_data, &files, &channels)
        {
            error!(channel_id, error = %err, "failed to write reply, tearing channel down");
            let _ = self.close_channel(channel_id);
            return Err(err.into());
        }

        // The reply is fully on the wire; only now may the channel produce
        // its next readiness event.
        self.poll
            .rearm(socket)
            .map_err(|e| EndpointError::sys("epoll_ctl", e))
    }

    /// Push a descriptor as a reply reference and reply with that reference
    /// as the return code.
    pub fn reply_with_fd(&self, message: &mut Message, fd: BorrowedFd<'_>) -> Result<()> {
        let reference = message.push_file(fd)?;
        self.reply(message, reference)
    }

    /// Push an existing channel as a reply reference and reply with that
    /// reference as the return code.
    pub fn reply_with_channel(&self, message: &mut Message, channel_id: i32) -> Result<()> {
        let reference = self.push_channel_handle(message, channel_id)?;
        self.reply(message, reference)
    }

    /// Queue an already-registered channel's (socket, event) pair as an
    /// outbound channel reference on `message`.
    pub fn push_channel_handle(
        &self,
        message: &mut Message,
        channel_id: i32,
    ) -> Result<ChannelReference> {
        let (socket_raw, event_raw) = {
            let table = self.table();
            let data = table
                .get(channel_id)
                .ok_or(EndpointError::UnknownChannel(channel_id))?;
            (data.socket.as_raw_fd(), data.event.as_raw_fd())
        };
        message.push_channel_raw(socket_raw, event_raw)
    }

    /// Create a new channel and hand its far end to the peer as a capability
    /// in the reply to `message`.
    ///
    /// Creates a connected socket pair, registers the near end as a channel
    /// with `state` attached, and queues the far end plus the new channel's
    /// event handle as an outbound channel reference. The far end is closed
    /// locally once the reply has been transmitted and the message dropped.
    ///
    /// Returns the new channel id and the outbound reference.
    pub fn push_channel(
        &self,
        message: &mut Message,
        state: Option<ServiceState>,
    ) -> Result<(i32, ChannelReference)> {
        let (near, far) = stream_pair().map_err(|e| EndpointError::sys("socketpair", e))?;
        set_passcred(near.as_fd()).map_err(|e| EndpointError::sys("setsockopt", e))?;
        let credentials =
            peer_credentials(near.as_fd()).unwrap_or_else(|_| Credentials::unknown());

        let channel_id = self.register_channel(near, credentials, state)?;
        debug!(channel_id, "pushed new channel");

        let event_raw = self
            .channel_event_raw(channel_id)
            .ok_or(EndpointError::UnknownChannel(channel_id))?;
        let reference = message.push_channel_raw(far.as_raw_fd(), event_raw)?;
        message.state_mut().sockets_to_close.push(far);
        Ok((channel_id, reference))
    }

    fn receive_message_for(&self, socket_raw: RawFd) -> Result<Message> {
        let channel_id = self.table().id_for_fd(socket_raw).unwrap_or(-1);
        // SAFETY: the channel's table entry keeps this socket open, and the
        // one-shot discipline guarantees this thread is the only one
        // handling it until it is re-armed.
        let socket = unsafe { BorrowedFd::borrow_raw(socket_raw) };

        let decoded = match recv_request(socket) {
            Ok(decoded) => decoded,
            Err(WireError::PeerClosed) => return Ok(self.build_close_message(channel_id)),
            Err(err) => {
                let _ = self.close_channel(channel_id);
                return Err(err.into());
            }
        };

        let header = decoded.header.clone();
        let credentials = decoded
            .credentials
            .or_else(|| self.channel_credentials(channel_id))
            .unwrap_or_else(Credentials::unknown);

        let info = MessageInfo {
            channel_id,
            message_id: if header.is_impulse {
                IMPULSE_MESSAGE_ID
            } else {
                self.next_message_id()
            },
            op: header.op,
            credentials,
            send_len: header.send_len as usize,
            recv_len: header.max_recv_len as usize,
            fd_count: decoded.files.len(),
            impulse_payload: header.impulse_payload,
            channel_state: self.channel_state(channel_id),
        };
        let mut state = MessageState::from_request(decoded);

        if header.send_len > 0 && !header.is_impulse {
            state.request_data = vec![0u8; header.send_len as usize];
            if let Err(err) = recv_exact(socket, &mut state.request_data) {
                // A peer that dies mid-payload is a protocol failure, not a
                // clean shutdown: tear the channel down.
                let _ = self.close_channel(channel_id);
                return Err(err.into());
            }
        }

        if header.is_impulse {
            // No reply will re-arm this channel; do it as soon as the header
            // is consumed.
            if let Err(e) = self.poll.rearm(socket) {
                let _ = self.close_channel(channel_id);
                return Err(EndpointError::sys("epoll_ctl", e));
            }
        }

        Ok(Message::new(info, state))
    }

    fn build_close_message(&self, channel_id: i32) -> Message {
        debug!(channel_id, "synthesizing close message");
        Message::new(
            MessageInfo {
                channel_id,
                message_id: self.next_message_id(),
                op: opcodes::CHANNEL_CLOSE,
                credentials: Credentials::unknown(),
                send_len: 0,
                recv_len: 0,
                fd_count: 0,
                impulse_payload: [0; IMPULSE_PAYLOAD_SIZE],
                channel_state: self.channel_state(channel_id),
            },
            MessageState::default(),
        )
    }

    fn next_message_id(&self) -> i32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_socket_raw(&self, channel_id: i32) -> Option<RawFd> {
        self.table().get(channel_id).map(|d| d.socket.as_raw_fd())
    }

    fn channel_event_raw(&self, channel_id: i32) -> Option<RawFd> {
        self.table().get(channel_id).map(|d| d.event.as_raw_fd())
    }

    fn channel_credentials(&self, channel_id: i32) -> Option<Credentials> {
        self.table().get(channel_id).map(|d| d.credentials)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(bound) = &self.bound {
            if let Ok(metadata) = std::fs::symlink_metadata(&bound.path) {
                if metadata.file_type().is_socket()
                    && (metadata.dev(), metadata.ino()) == bound.dev_ino
                {
                    debug!(path = ?bound.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&bound.path);
                } else {
                    debug!(
                        path = ?bound.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}
