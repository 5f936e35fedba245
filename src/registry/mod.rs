//! Connection registry
//!
//! Bookkeeping for live connections: peer address, TLS sub-state, direction
//! flags, broadcast membership, and the writer handle used to push bytes at
//! the connection's task. The registry does no I/O itself; it is mutated
//! only from the event loop.
//!
//! Identities are allocated from a monotone counter and never reused, so a
//! `ConnId` held by a relay pass can never alias a later connection.
//! Removal takes the entry out of every role at once: dropping it drops the
//! writer handle, which is what ultimately closes the connection's task.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::tls::TlsState;

/// Stable identity of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Pseudo-identity for data originating on standard input
    pub const STDIN: ConnId = ConnId(0);
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryFull;

impl std::fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection registry is full")
    }
}

impl std::error::Error for RegistryFull {}

/// Per-connection bookkeeping entry
#[derive(Debug)]
pub struct ConnEntry {
    /// Remote peer address
    pub peer: SocketAddr,

    /// TLS negotiation sub-state
    pub tls: TlsState,

    /// Whether the event loop reads relay data from this connection
    pub may_read: bool,

    /// Whether fan-out writes may target this connection
    pub may_write: bool,

    /// Member of the broadcast set
    pub in_broadcast: bool,

    /// Writer handle into the connection task
    pub(crate) tx: mpsc::Sender<Bytes>,
}

impl ConnEntry {
    /// Create an entry for a freshly admitted peer
    pub fn new(peer: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            peer,
            tls: TlsState::None,
            may_read: true,
            may_write: true,
            in_broadcast: false,
            tx,
        }
    }

    /// Eligible for relay I/O (plaintext or an established TLS session)
    pub fn relay_eligible(&self) -> bool {
        matches!(self.tls, TlsState::None | TlsState::Established)
    }
}

/// Ordered collection of live connections with a fixed capacity
///
/// Backed by an ordered map, so the maximum identity and ascending-order
/// traversal fall out of the structure instead of being maintained in
/// parallel bookkeeping.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: BTreeMap<ConnId, ConnEntry>,
    capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry sized for `conn_limit` peers plus a reserve for
    /// the listeners and standard input
    pub fn new(conn_limit: usize, reserve: usize) -> Self {
        Self::with_capacity(conn_limit.saturating_add(reserve))
    }

    /// Create a registry with an explicit capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Register a connection; fails when the registry is at capacity
    pub fn add(&mut self, id: ConnId, entry: ConnEntry) -> Result<(), RegistryFull> {
        if self.entries.len() >= self.capacity {
            return Err(RegistryFull);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Remove a connection, returning its entry; no-op for a non-member
    pub fn remove(&mut self, id: ConnId) -> Option<ConnEntry> {
        self.entries.remove(&id)
    }

    /// Look up a member's metadata
    pub fn lookup(&self, id: ConnId) -> Option<&ConnEntry> {
        self.entries.get(&id)
    }

    /// Look up a member's metadata mutably
    pub fn lookup_mut(&mut self, id: ConnId) -> Option<&mut ConnEntry> {
        self.entries.get_mut(&id)
    }

    /// Highest live identity, or `None` when the registry is empty
    pub fn max_id(&self) -> Option<ConnId> {
        self.entries.last_key_value().map(|(id, _)| *id)
    }

    /// Visit members with identity <= `bound`, in ascending order
    pub fn for_each_up_to<F>(&self, bound: ConnId, mut f: F)
    where
        F: FnMut(ConnId, &ConnEntry),
    {
        for (id, entry) in self.entries.range(..=bound) {
            f(*id, entry);
        }
    }

    /// Iterate all members in ascending identity order
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &ConnEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Number of live members
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no members
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fixed capacity set at construction
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
