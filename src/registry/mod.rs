//! Registry client abstraction.
//!
//! The coordinator is built on top of a hierarchical, watchable key-value
//! registry consumed through the [`RegistryClient`] trait:
//!
//! - **Persistent and ephemeral entries**: ephemeral entries vanish when the
//!   creating session ends, which is how instance liveness and the leader
//!   token are modelled.
//! - **Watches**: [`RegistryClient::add_data_listener`] delivers change
//!   notifications for a subtree over a bounded channel. Delivery is
//!   at-least-once and ordered per subtree only.
//! - **Mutual exclusion**: [`RegistryClient::acquire_latch`] scopes a
//!   critical section to a latch path; the latch is held until the returned
//!   guard is dropped.
//!
//! [`MemoryRegistry`] is the in-process implementation used by tests and
//! single-host deployments.

pub mod memory;

use std::any::Any;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use memory::{MemoryRegistry, MemoryRegistryClient, SessionId};

/// Kind of change observed under a watched subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEventKind {
    Added,
    Updated,
    Removed,
}

/// One change notification. For removals, `value` carries the entry's last
/// known value.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub kind: DataEventKind,
    pub path: String,
    pub value: String,
}

/// A cancellable watch subscription. Dropping the subscription cancels the
/// watch.
pub struct DataSubscription {
    events: mpsc::Receiver<DataEvent>,
    token: CancellationToken,
}

impl DataSubscription {
    pub fn new(events: mpsc::Receiver<DataEvent>, token: CancellationToken) -> Self {
        Self { events, token }
    }

    /// Receive the next event; `None` once the watch is closed.
    pub async fn recv(&mut self) -> Option<DataEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for DataSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Guard of a registry mutual-exclusion latch. The latch is released when
/// the guard is dropped.
pub struct LatchGuard {
    _inner: Box<dyn Any + Send>,
}

impl LatchGuard {
    pub fn new(inner: impl Any + Send) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

/// One operation of a registry transaction.
#[derive(Debug, Clone)]
pub enum TxOp {
    Create { path: String, value: String },
    Update { path: String, value: String },
    Delete { path: String },
}

/// Hierarchical, watchable key-value registry.
///
/// Implementations must provide last-write-wins per path; cross-path
/// atomicity is only available through
/// [`Self::execute_in_transaction`].
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Create a persistent entry, or update it if it already exists.
    async fn persist(&self, path: &str, value: &str) -> Result<()>;

    /// Update an entry's value, creating it if absent.
    async fn update(&self, path: &str, value: &str) -> Result<()>;

    /// Read an entry, possibly served from a local cache.
    async fn get(&self, path: &str) -> Result<Option<String>>;

    /// Read an entry, bypassing any local cache.
    async fn get_directly(&self, path: &str) -> Result<Option<String>>;

    /// Remove an entry and all of its descendants. Removing an absent path
    /// is a no-op.
    async fn remove(&self, path: &str) -> Result<()>;

    async fn is_existed(&self, path: &str) -> Result<bool>;

    /// Names of the direct children of `path`, sorted.
    async fn get_children_keys(&self, path: &str) -> Result<Vec<String>>;

    async fn get_num_children(&self, path: &str) -> Result<usize>;

    /// Create an ephemeral entry bound to this client's session, replacing
    /// any existing entry at the path.
    async fn persist_ephemeral(&self, path: &str, value: &str) -> Result<()>;

    /// Acquire the mutual-exclusion latch at `latch_path`. Blocks until the
    /// latch is won; the critical section lasts until the guard is dropped.
    async fn acquire_latch(&self, latch_path: &str) -> Result<LatchGuard>;

    /// Watch a subtree for changes. Only changes after subscription time are
    /// delivered; delivery is at-least-once, bounded, and ordered per
    /// subtree.
    async fn add_data_listener(&self, subtree: &str) -> Result<DataSubscription>;

    /// Apply a list of operations atomically with respect to all other
    /// registry operations.
    async fn execute_in_transaction(&self, ops: Vec<TxOp>) -> Result<()>;
}
