//! The channel table: id → per-channel state, with a reverse map from raw
//! socket descriptor to id.
//!
//! Both maps are mutated together and stay mutually consistent after every
//! operation. The table itself is lock-free data; the [`Endpoint`] guards it
//! with one mutex.
//!
//! [`Endpoint`]: crate::endpoint::Endpoint

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use sockmux_handle::Credentials;

/// Opaque service-defined per-channel state. The transport never looks
/// inside; it only stores and returns it.
pub type ServiceState = Arc<dyn Any + Send + Sync>;

/// State for one accepted connection.
#[derive(Debug)]
pub(crate) struct ChannelData {
    /// Owned data socket for this connection.
    pub socket: OwnedFd,
    /// Owned eventfd the service uses to signal the client asynchronously.
    pub event: OwnedFd,
    /// Peer identity captured at accept time via SO_PEERCRED.
    pub credentials: Credentials,
    /// Opaque service-level channel state.
    pub state: Option<ServiceState>,
    /// Currently signalled readiness mask, service-defined bits.
    pub pending_events: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    channels: BTreeMap<i32, ChannelData>,
    fd_to_id: HashMap<RawFd, i32>,
    last_id: i32,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel under the next free id, scanning upward from a
    /// rolling counter and wrapping past `i32::MAX` back to 1. Id 0 is never
    /// assigned.
    pub fn insert(&mut self, data: ChannelData) -> i32 {
        loop {
            self.last_id = if self.last_id == i32::MAX {
                1
            } else {
                self.last_id + 1
            };
            if !self.channels.contains_key(&self.last_id) {
                self.fd_to_id.insert(data.socket.as_raw_fd(), self.last_id);
                self.channels.insert(self.last_id, data);
                return self.last_id;
            }
        }
    }

    /// Remove a channel, erasing both map entries.
    pub fn remove(&mut self, channel_id: i32) -> Option<ChannelData> {
        let data = self.channels.remove(&channel_id)?;
        self.fd_to_id.remove(&data.socket.as_raw_fd());
        Some(data)
    }

    pub fn get(&self, channel_id: i32) -> Option<&ChannelData> {
        self.channels.get(&channel_id)
    }

    pub fn get_mut(&mut self, channel_id: i32) -> Option<&mut ChannelData> {
        self.channels.get_mut(&channel_id)
    }

    /// Reverse lookup: raw socket descriptor to channel id.
    pub fn id_for_fd(&self, fd: RawFd) -> Option<i32> {
        self.fd_to_id.get(&fd).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[cfg(test)]
    fn set_last_id(&mut self, id: i32) {
        self.last_id = id;
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.channels.len() == self.fd_to_id.len()
            && self.channels.iter().all(|(id, data)| {
                self.fd_to_id.get(&data.socket.as_raw_fd()) == Some(id)
            })
    }
}

#[cfg(test)]
mod tests {
    use sockmux_handle::{eventfd, stream_pair};

    use super::*;

    fn sample_channel() -> (ChannelData, OwnedFd) {
        let (socket, far) = stream_pair().unwrap();
        let data = ChannelData {
            socket,
            event: eventfd().unwrap(),
            credentials: Credentials::unknown(),
            state: None,
            pending_events: 0,
        };
        (data, far)
    }

    #[test]
    fn maps_stay_consistent_across_insert_and_remove() {
        let mut table = ChannelTable::new();
        let mut keep_alive = Vec::new();
        let mut ids = Vec::new();

        for _ in 0..8 {
            let (data, far) = sample_channel();
            keep_alive.push(far);
            ids.push(table.insert(data));
            assert!(table.is_consistent());
        }

        for id in ids.iter().step_by(2) {
            assert!(table.remove(*id).is_some());
            assert!(table.is_consistent());
        }
        assert_eq!(table.len(), 4);

        for id in ids.iter().skip(1).step_by(2) {
            assert!(table.get(*id).is_some());
            let fd = table.get(*id).unwrap().socket.as_raw_fd();
            assert_eq!(table.id_for_fd(fd), Some(*id));
        }
    }

    #[test]
    fn ids_are_not_reused_while_open() {
        let mut table = ChannelTable::new();
        let (data, _far_a) = sample_channel();
        let first = table.insert(data);
        let (data, _far_b) = sample_channel();
        let second = table.insert(data);

        assert_ne!(first, second);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn wraparound_skips_zero_and_live_ids() {
        let mut table = ChannelTable::new();
        let (data, _far_a) = sample_channel();
        let low = table.insert(data);
        assert_eq!(low, 1);

        table.set_last_id(i32::MAX - 1);
        let (data, _far_b) = sample_channel();
        assert_eq!(table.insert(data), i32::MAX);

        // Counter wraps to 1, which is still live, so the next free id is 2.
        let (data, _far_c) = sample_channel();
        assert_eq!(table.insert(data), 2);
        assert!(table.is_consistent());
    }

    #[test]
    fn freed_id_is_reassignable_after_wraparound() {
        let mut table = ChannelTable::new();
        let (data, _far_a) = sample_channel();
        let id = table.insert(data);
        table.remove(id).unwrap();

        table.set_last_id(i32::MAX);
        let (data, _far_b) = sample_channel();
        assert_eq!(table.insert(data), 1);
    }

    #[test]
    fn remove_unknown_id_is_none() {
        let mut table = ChannelTable::new();
        assert!(table.remove(99).is_none());
        assert_eq!(table.id_for_fd(1234), None);
    }
}
