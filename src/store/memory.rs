//! In-process revisioned key-value store.
//!
//! # Responsibilities
//! - Serve the `KvStore` contract for the `memory` backend and for tests
//! - Keep a revision history so watches can resume and compaction can bite
//! - Inject failures (rejected writes, broken watches, lost leader)
//! - Record the order of successful writes and deletes
//!
//! # Design Decisions
//! - Every mutation bumps the revision by one, like etcd
//! - Watch replay and live delivery share one channel per watcher

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::store::kv::{
    EventKind, KeyValue, KvError, KvResult, KvStore, ListResponse, WatchEvent, WatchResponse,
    WatchStream,
};

/// A successful mutation, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put(String),
    Delete(String),
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<KvResult<WatchResponse>>,
}

struct Inner {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
    compact_revision: i64,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
    has_leader: bool,
    failing_keys: Vec<String>,
    operations: Vec<Operation>,
    list_calls: usize,
}

impl Inner {
    fn is_failing(&self, key: &str) -> bool {
        self.failing_keys.iter().any(|pattern| key.contains(pattern.as_str()))
    }

    fn publish(&mut self, event: WatchEvent) {
        let revision = self.revision;
        self.watchers.retain(|watcher| {
            if !event.key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            let response = WatchResponse {
                revision,
                events: vec![event.clone()],
            };
            watcher.tx.send(Ok(response)).is_ok()
        });
        self.history.push(event);
    }
}

/// Revisioned in-memory key-value store.
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
                compact_revision: 0,
                history: Vec::new(),
                watchers: Vec::new(),
                has_leader: true,
                failing_keys: Vec::new(),
                operations: Vec::new(),
                list_calls: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().data.get(key).map(|kv| kv.value.clone())
    }

    /// Discard history up to and including `revision`.
    pub fn compact(&self, revision: i64) {
        let mut inner = self.lock();
        let revision = revision.min(inner.revision);
        inner.history.retain(|event| event.mod_revision > revision);
        inner.compact_revision = inner.compact_revision.max(revision);
        tracing::debug!(revision, "Memory store compacted");
    }

    /// Terminate every open watch with `error`.
    pub fn interrupt_watchers(&self, error: KvError) {
        let mut inner = self.lock();
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(error.clone()));
        }
    }

    /// Toggle leader availability; losing the leader cancels require-leader watches.
    pub fn set_leader(&self, available: bool) {
        self.lock().has_leader = available;
        if !available {
            self.interrupt_watchers(KvError::NoLeader);
        }
    }

    /// Reject puts and deletes of keys containing `pattern`.
    pub fn fail_keys_matching(&self, pattern: &str) {
        self.lock().failing_keys.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_keys.clear();
    }

    /// Successful mutations so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Number of prefix listings served.
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|watcher| !watcher.tx.is_closed());
        inner.watchers.len()
    }

    fn apply_put(&self, key: &str, value: Vec<u8>) -> KvResult<i64> {
        let mut inner = self.lock();
        if inner.is_failing(key) {
            return Err(KvError::Unavailable(format!("put {} rejected", key)));
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.data.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.clone(),
                mod_revision: revision,
            },
        );
        inner.operations.push(Operation::Put(key.to_string()));
        inner.publish(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value,
            mod_revision: revision,
        });
        Ok(revision)
    }

    fn apply_delete(&self, key: &str) -> KvResult<i64> {
        let mut inner = self.lock();
        if inner.is_failing(key) {
            return Err(KvError::Unavailable(format!("delete {} rejected", key)));
        }
        inner.operations.push(Operation::Delete(key.to_string()));
        if inner.data.remove(key).is_none() {
            return Ok(inner.revision);
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.publish(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            mod_revision: revision,
        });
        Ok(revision)
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn list(&self, prefix: &str) -> KvResult<ListResponse> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        let kvs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(ListResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: i64,
        require_leader: bool,
    ) -> KvResult<WatchStream> {
        let mut inner = self.lock();
        if require_leader && !inner.has_leader {
            return Err(KvError::NoLeader);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if start_revision > 0 && start_revision <= inner.compact_revision {
            let _ = tx.send(Err(KvError::Compacted {
                requested: start_revision,
                compact_revision: inner.compact_revision,
            }));
            return Ok(rx);
        }
        if start_revision > inner.revision + 1 {
            let _ = tx.send(Err(KvError::FutureRevision {
                requested: start_revision,
                current: inner.revision,
            }));
            return Ok(rx);
        }

        let backlog: Vec<WatchEvent> = inner
            .history
            .iter()
            .filter(|event| event.mod_revision >= start_revision && event.key.starts_with(prefix))
            .cloned()
            .collect();
        if !backlog.is_empty() {
            let _ = tx.send(Ok(WatchResponse {
                revision: inner.revision,
                events: backlog,
            }));
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<i64> {
        self.apply_put(key, value)
    }

    async fn delete(&self, key: &str) -> KvResult<i64> {
        self.apply_delete(key)
    }
}
