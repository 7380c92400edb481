//! Per-worker connection state.
//!
//! Each worker owns a slab-backed table of its assigned connections plus an
//! fd-to-index map, populated before the first operation is armed and never
//! touched by another thread. A slot index stays valid for the connection's
//! whole lifetime and is never handed to a different live connection.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use slab::Slab;

use crate::metrics::ConnCounters;

/// Operation state of a connection.
///
/// In full-duplex mode exactly one operation is in flight per connection,
/// tracked here with its buffer and progress. Half-duplex broadcast keeps
/// several unpaired sends in flight, identified by their tokens alone.
#[derive(Debug, Clone, Copy)]
pub enum ConnState {
    /// Accepted, nothing armed yet.
    Idle,
    /// A receive is armed into a request-class buffer; `filled` bytes of
    /// the fixed-size record have arrived so far.
    Receiving { buf: u32, filled: usize },
    /// A send is armed from a payload-class buffer.
    Sending {
        buf: u32,
        written: usize,
        total: usize,
    },
    /// Half-duplex broadcast; in-flight sends are tracked by token.
    Broadcasting,
}

/// A single client connection owned by one worker.
#[derive(Debug)]
pub struct Connection {
    pub fd: RawFd,
    pub state: ConnState,
    pub counters: ConnCounters,
    /// Payload buffers with an unpaired send in flight (broadcast mode
    /// only). Needed to reconstruct cancellation targets at drain time;
    /// the buffers themselves are reclaimed by their completions.
    pub inflight_sends: Vec<u32>,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: ConnState::Idle,
            counters: ConnCounters::default(),
            inflight_sends: Vec::new(),
        }
    }

    pub fn start_receiving(&mut self, buf: u32) {
        self.state = ConnState::Receiving { buf, filled: 0 };
    }

    pub fn start_sending(&mut self, buf: u32, total: usize) {
        self.state = ConnState::Sending {
            buf,
            written: 0,
            total,
        };
    }
}

/// The worker's view of its assigned connections.
pub struct ConnectionTable {
    conns: Slab<Connection>,
    by_fd: HashMap<RawFd, usize>,
    quota: usize,
}

impl ConnectionTable {
    pub fn new(quota: usize) -> Self {
        Self {
            conns: Slab::with_capacity(quota),
            by_fd: HashMap::with_capacity(quota),
            quota,
        }
    }

    /// Insert an accepted connection, recording the fd mapping.
    ///
    /// Returns `None` once the worker's quota is reached.
    pub fn insert(&mut self, fd: RawFd) -> Option<usize> {
        if self.conns.len() >= self.quota {
            return None;
        }
        let index = self.conns.insert(Connection::new(fd));
        self.by_fd.insert(fd, index);
        Some(index)
    }

    pub fn get(&self, index: usize) -> Option<&Connection> {
        self.conns.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.conns.get_mut(index)
    }

    /// Stable index for a live connection's fd.
    pub fn index_of(&self, fd: RawFd) -> Option<usize> {
        self.by_fd.get(&fd).copied()
    }

    /// Remove a connection, releasing its fd mapping. The slot index is not
    /// reissued during the run because assignment happened up front.
    pub fn remove(&mut self, index: usize) -> Option<Connection> {
        if !self.conns.contains(index) {
            return None;
        }
        let conn = self.conns.remove(index);
        self.by_fd.remove(&conn.fd);
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.conns.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection)> {
        self.conns.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut conn = Connection::new(42);
        assert!(matches!(conn.state, ConnState::Idle));

        conn.start_receiving(3);
        assert!(matches!(conn.state, ConnState::Receiving { buf: 3, filled: 0 }));

        conn.start_sending(7, 4108);
        assert!(matches!(
            conn.state,
            ConnState::Sending {
                buf: 7,
                written: 0,
                total: 4108
            }
        ));
    }

    #[test]
    fn test_table_quota_and_fd_lookup() {
        let mut table = ConnectionTable::new(2);

        let a = table.insert(10).unwrap();
        let b = table.insert(11).unwrap();
        assert!(table.insert(12).is_none());

        assert_eq!(table.index_of(10), Some(a));
        assert_eq!(table.index_of(11), Some(b));
        assert_eq!(table.index_of(12), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_clears_fd_mapping() {
        let mut table = ConnectionTable::new(2);
        let a = table.insert(10).unwrap();
        table.insert(11).unwrap();

        let removed = table.remove(a).unwrap();
        assert_eq!(removed.fd, 10);
        assert_eq!(table.index_of(10), None);
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
    }
}
