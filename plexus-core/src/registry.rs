//! Per-process connection registry.
//!
//! The registry owns connection-identity allocation and the two lookup maps
//! message dispatch relies on: identity to live handle, and class/topic tag
//! to member identities. It is an explicitly constructed, explicitly owned
//! instance passed to its collaborators; there is no process-wide global.
//!
//! # Identity format
//!
//! Connection IDs combine the process-unique server id with a
//! monotonically increasing counter, rendered as an opaque string:
//! `"{server_id}-{counter:x}"`. An ID is unique within the cluster for the
//! process's lifetime and is never reused.
//!
//! # Locking
//!
//! Both maps live behind one `RwLock` so that removal is atomic across
//! them: there is no window where a stale tag membership points at a
//! removed handle. Registration and removal take the write lock; lookups
//! and membership snapshots take the read lock.
//!
//! # Examples
//!
//! ```
//! use plexus_core::registry::ConnectionRegistry;
//! use plexus_core::connection::Connection;
//! use tokio::sync::mpsc;
//!
//! let registry = ConnectionRegistry::new("srv1");
//! let (frames, _) = mpsc::unbounded_channel();
//! let (envelopes, _) = mpsc::unbounded_channel();
//! let conn = Connection::new(
//!     registry.allocate_id(),
//!     vec!["chat".to_string()],
//!     "127.0.0.1:0".parse().unwrap(),
//!     frames,
//!     envelopes,
//! );
//! let id = registry.register(conn).unwrap();
//! assert!(registry.lookup(&id).is_some());
//! assert!(registry.members_of("chat").contains(&id));
//! ```

use crate::connection::Connection;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};

/// A unique, opaque connection identity.
///
/// Stable for the connection's lifetime and safe to transmit to remote
/// peers for later unicast targeting.
pub type ConnectionId = String;

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    tags: HashMap<String, HashSet<ConnectionId>>,
}

/// Thread-safe mapping from connection identity to live handle, with a
/// secondary tag-membership index.
pub struct ConnectionRegistry {
    server_id: String,
    counter: AtomicU64,
    closed: AtomicBool,
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry owned by the given server id.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// The process-unique server id this registry allocates identities
    /// under.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Allocates a fresh connection identity.
    ///
    /// Identities are monotonic and never handed out twice.
    pub fn allocate_id(&self) -> ConnectionId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:x}", self.server_id, n)
    }

    /// Registers a connection under its identity and every one of its tags.
    ///
    /// The insert is atomic across both maps. Returns the connection's
    /// identity, or [`Error::Closed`] once the registry has been closed for
    /// shutdown.
    pub fn register(&self, conn: Connection) -> Result<ConnectionId> {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Rejected registration for {}: registry closed", conn.id());
            return Err(Error::Closed);
        }
        let id = conn.id().clone();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for tag in conn.tags() {
            inner.tags.entry(tag.clone()).or_default().insert(id.clone());
        }
        inner.connections.insert(id.clone(), conn);
        info!(
            "Registered connection {} (total: {})",
            id,
            inner.connections.len()
        );
        Ok(id)
    }

    /// Removes a connection from the identity map and every tag set it was
    /// registered under, atomically.
    ///
    /// Idempotent: unregistering an unknown identity is a no-op, supporting
    /// cleanup races.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let conn = inner.connections.remove(id)?;
        for tag in conn.tags() {
            if let Some(members) = inner.tags.get_mut(tag) {
                members.remove(id);
                if members.is_empty() {
                    inner.tags.remove(tag);
                }
            }
        }
        info!(
            "Unregistered connection {} (total: {})",
            id,
            inner.connections.len()
        );
        Some(conn)
    }

    /// Looks up a live connection handle by identity.
    pub fn lookup(&self, id: &ConnectionId) -> Option<Connection> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.get(id).cloned()
    }

    /// Returns a snapshot of the identities registered under `tag`.
    ///
    /// The snapshot is not a live view; members may come and go after it is
    /// taken.
    pub fn members_of(&self, tag: &str) -> HashSet<ConnectionId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.tags.get(tag).cloned().unwrap_or_default()
    }

    /// Returns handles for every registered connection.
    pub fn all_connections(&self) -> Vec<Connection> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.values().cloned().collect()
    }

    /// Returns every registered identity.
    pub fn all_ids(&self) -> Vec<ConnectionId> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.keys().cloned().collect()
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.connections.len()
    }

    /// Stops accepting new registrations. Existing connections stay
    /// registered until they unregister; this is the graceful-drain point
    /// for process shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("Registry closed to new registrations");
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
