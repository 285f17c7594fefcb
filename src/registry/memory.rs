//! In-process registry with session-scoped ephemeral entries and subtree
//! watches. One [`MemoryRegistry`] is shared by every instance of a test
//! cluster or single-host deployment; each instance connects its own
//! session so that expiring the session removes that instance's ephemeral
//! entries exactly like a crashed process.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{DataEvent, DataEventKind, DataSubscription, LatchGuard, RegistryClient, TxOp};
use crate::error::Result;

const WATCH_CHANNEL_CAPACITY: usize = 256;

pub type SessionId = u64;

#[derive(Debug, Clone)]
struct NodeRecord {
    value: String,
    /// Session that owns this entry, for ephemeral entries.
    ephemeral: Option<SessionId>,
}

struct Watcher {
    subtree: String,
    tx: mpsc::Sender<DataEvent>,
    token: CancellationToken,
}

#[derive(Default)]
struct Store {
    nodes: BTreeMap<String, NodeRecord>,
    watchers: Vec<Watcher>,
}

impl Store {
    /// Record an event and collect the senders it must be delivered to.
    /// Delivery happens after the store lock is released.
    fn notify(&mut self, event: DataEvent, out: &mut Vec<(mpsc::Sender<DataEvent>, DataEvent)>) {
        self.watchers
            .retain(|w| !w.token.is_cancelled() && !w.tx.is_closed());
        for watcher in &self.watchers {
            let matches = event.path == watcher.subtree
                || event.path.starts_with(&format!("{}/", watcher.subtree));
            if matches {
                out.push((watcher.tx.clone(), event.clone()));
            }
        }
    }

    fn write_node(
        &mut self,
        path: &str,
        value: &str,
        ephemeral: Option<SessionId>,
        out: &mut Vec<(mpsc::Sender<DataEvent>, DataEvent)>,
    ) {
        let kind = if self.nodes.contains_key(path) {
            DataEventKind::Updated
        } else {
            DataEventKind::Added
        };
        self.nodes.insert(
            path.to_string(),
            NodeRecord {
                value: value.to_string(),
                ephemeral,
            },
        );
        self.notify(
            DataEvent {
                kind,
                path: path.to_string(),
                value: value.to_string(),
            },
            out,
        );
    }

    /// Remove `path` and all of its descendants, children first.
    fn remove_subtree(&mut self, path: &str, out: &mut Vec<(mpsc::Sender<DataEvent>, DataEvent)>) {
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| k.as_str() == path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed.into_iter().rev() {
            if let Some(record) = self.nodes.remove(&key) {
                self.notify(
                    DataEvent {
                        kind: DataEventKind::Removed,
                        path: key,
                        value: record.value,
                    },
                    out,
                );
            }
        }
    }
}

/// Shared in-process registry. Connect one client per logical process.
pub struct MemoryRegistry {
    store: RwLock<Store>,
    latches: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_session: AtomicU64,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(Store::default()),
            latches: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Open a new session and return a client bound to it.
    pub fn connect(self: &Arc<Self>) -> MemoryRegistryClient {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        MemoryRegistryClient {
            registry: self.clone(),
            session,
        }
    }

    /// End a session: every ephemeral entry it created is removed and
    /// removal events are delivered to watchers, exactly as if the owning
    /// process had crashed.
    pub async fn expire_session(&self, session: SessionId) {
        let mut pending = Vec::new();
        {
            let mut store = self.store.write().await;
            let doomed: Vec<String> = store
                .nodes
                .iter()
                .filter(|(_, record)| record.ephemeral == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            for path in doomed {
                store.remove_subtree(&path, &mut pending);
            }
        }
        Self::deliver(pending).await;
    }

    async fn deliver(pending: Vec<(mpsc::Sender<DataEvent>, DataEvent)>) {
        for (tx, event) in pending {
            // A full or closed channel drops the event; watch delivery is
            // best-effort and consumers re-check registry state anyway.
            if let Err(e) = tx.try_send(event) {
                tracing::warn!(error = %e, "Watch event dropped");
            }
        }
    }
}

/// One session's handle to a [`MemoryRegistry`].
pub struct MemoryRegistryClient {
    registry: Arc<MemoryRegistry>,
    session: SessionId,
}

impl MemoryRegistryClient {
    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistryClient {
    async fn persist(&self, path: &str, value: &str) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut store = self.registry.store.write().await;
            store.write_node(path, value, None, &mut pending);
        }
        MemoryRegistry::deliver(pending).await;
        Ok(())
    }

    async fn update(&self, path: &str, value: &str) -> Result<()> {
        self.persist(path, value).await
    }

    async fn get(&self, path: &str) -> Result<Option<String>> {
        let store = self.registry.store.read().await;
        Ok(store.nodes.get(path).map(|r| r.value.clone()))
    }

    // The in-memory registry has no local cache, so a direct read is the
    // same as a cached one.
    async fn get_directly(&self, path: &str) -> Result<Option<String>> {
        self.get(path).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut store = self.registry.store.write().await;
            store.remove_subtree(path, &mut pending);
        }
        MemoryRegistry::deliver(pending).await;
        Ok(())
    }

    async fn is_existed(&self, path: &str) -> Result<bool> {
        let store = self.registry.store.read().await;
        if store.nodes.contains_key(path) {
            return Ok(true);
        }
        let prefix = format!("{}/", path);
        Ok(store.nodes.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)))
    }

    async fn get_children_keys(&self, path: &str) -> Result<Vec<String>> {
        let store = self.registry.store.read().await;
        let prefix = format!("{}/", path);
        let mut children = BTreeSet::new();
        for key in store.nodes.range(prefix.clone()..) {
            let (key, _) = key;
            if !key.starts_with(&prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let child = rest.split('/').next().unwrap_or(rest);
            if !child.is_empty() {
                children.insert(child.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn get_num_children(&self, path: &str) -> Result<usize> {
        Ok(self.get_children_keys(path).await?.len())
    }

    async fn persist_ephemeral(&self, path: &str, value: &str) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut store = self.registry.store.write().await;
            store.write_node(path, value, Some(self.session), &mut pending);
        }
        MemoryRegistry::deliver(pending).await;
        Ok(())
    }

    async fn acquire_latch(&self, latch_path: &str) -> Result<LatchGuard> {
        let mutex = {
            let mut latches = self.registry.latches.lock().await;
            latches
                .entry(latch_path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(LatchGuard::new(guard))
    }

    async fn add_data_listener(&self, subtree: &str) -> Result<DataSubscription> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        {
            let mut store = self.registry.store.write().await;
            store.watchers.push(Watcher {
                subtree: subtree.to_string(),
                tx,
                token: token.clone(),
            });
        }
        Ok(DataSubscription::new(rx, token))
    }

    async fn execute_in_transaction(&self, ops: Vec<TxOp>) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut store = self.registry.store.write().await;
            for op in ops {
                match op {
                    TxOp::Create { path, value } | TxOp::Update { path, value } => {
                        store.write_node(&path, &value, None, &mut pending);
                    }
                    TxOp::Delete { path } => {
                        store.remove_subtree(&path, &mut pending);
                    }
                }
            }
        }
        MemoryRegistry::deliver(pending).await;
        Ok(())
    }
}
