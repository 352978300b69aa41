//! Resource limits for a relay session and in-flight connection tracking.
//!
//! Split into two types:
//!
//! - [`RelayLimits`]: plain configuration (both limits off by default).
//! - [`ConnectionTracker`]: the runtime counter shared between the accept
//!   loop, every connection task, and the controller's status snapshot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Optional bounds on a relay session.
///
/// With both fields `None` the relay accepts an unbounded number of
/// connections and lets each one live for as long as its peers keep it open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayLimits {
    /// Maximum number of concurrently relayed connection pairs.
    pub max_connections: Option<usize>,
    /// Tear a pair down after this long with no bytes in either direction.
    pub idle_timeout: Option<Duration>,
}

/// Counts live connections and hands out connection ids.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    max_connections: Option<usize>,
}

impl ConnectionTracker {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            max_connections,
        }
    }

    /// Reserve a slot for a new connection.
    ///
    /// Returns `None` when the cap is reached. The returned guard releases
    /// the slot on drop and is `Send`, so it moves into the connection task
    /// and keeps the connection counted until that task ends.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let limit = self.max_connections.unwrap_or(usize::MAX);
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()?;
        Some(ConnectionGuard {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            counter: self.active.clone(),
        })
    }

    /// Number of connections currently holding a guard.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }
}

/// RAII slot in a [`ConnectionTracker`]; decrements the count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: u64,
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Session-unique, monotonically increasing connection id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
