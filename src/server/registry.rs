//! Live connection registry.
//!
//! Owned by one server instance. Entries are shared as `Arc`s so a drain
//! loop that still holds a scheduler never observes freed state after the
//! connection is removed.

use crate::pipeline::scheduler::ProcessingScheduler;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Monotonically increasing per-server connection identifier.
pub type ConnectionId = u64;

/// A registered connection.
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub scheduler: Arc<ProcessingScheduler>,
    connected_at: Instant,
}

impl ConnectionEntry {
    pub fn new(id: ConnectionId, peer: SocketAddr, scheduler: Arc<ProcessingScheduler>) -> Self {
        Self {
            id,
            peer,
            scheduler,
            connected_at: Instant::now(),
        }
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub queued: usize,
    pub active: bool,
    pub processed: u64,
    pub connected_for: Duration,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<ConnectionEntry>>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id, starting at 1.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn add(&self, entry: Arc<ConnectionEntry>) {
        self.connections.write().await.insert(entry.id, entry);
    }

    /// Remove a connection and cancel its scheduler.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        let entry = self.connections.write().await.remove(&id)?;
        entry.scheduler.cancel();
        Some(entry)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Registered ids in ascending order.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Scheduler state of every connection, ordered by id.
    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .values()
            .map(|entry| ConnectionInfo {
                id: entry.id,
                peer: entry.peer,
                queued: entry.scheduler.queued(),
                active: entry.scheduler.is_active(),
                processed: entry.scheduler.processed(),
                connected_for: entry.age(),
            })
            .collect();
        infos.sort_unstable_by_key(|info| info.id);
        infos
    }

    /// Cancel every scheduler and empty the registry. Returns how many
    /// connections were removed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, entry) in &drained {
            entry.scheduler.cancel();
        }
        drained.len()
    }
}
