//! Resource cache kept current by full listing plus incremental watch.
//!
//! # State Transitions
//! ```text
//! Uninitialized → FullSyncing: cache constructed
//! FullSyncing → Watching: watch channel opened
//! Watching → Resyncing: watch failed with compaction / future revision
//! Resyncing → Watching: full listing succeeded, watch reopened
//! ```
//!
//! # Design Decisions
//! - Watches resume from `current_revision + 1`, so no event is applied twice
//! - A gap in history is never patched; a full listing re-derives ground truth
//! - Every reconnect waits out a fixed retry interval
//! - Undecodable documents are skipped and logged, never fatal; one that
//!   overwrites a cached resource evicts it

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::apisix::{ApisixResource, ResourceKind};
use crate::observability::metrics;
use crate::store::error::{StoreError, StoreResult};
use crate::store::kv::{EventKind, KvError, KvStore, WatchResponse, WatchStream};

/// Value the proxy writes for directory keys.
const DIRECTORY_MARKER: &[u8] = b"init_dir";

/// Empty JSON object, written by the proxy before a real resource exists.
const EMPTY_OBJECT: &[u8] = b"{}";

/// Cache lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized = 0,
    FullSyncing = 1,
    Watching = 2,
    Resyncing = 3,
}

impl From<u8> for CacheState {
    fn from(val: u8) -> Self {
        match val {
            1 => CacheState::FullSyncing,
            2 => CacheState::Watching,
            3 => CacheState::Resyncing,
            _ => CacheState::Uninitialized,
        }
    }
}

/// Tunables of a resource cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Deadline of a full listing.
    pub list_timeout: Duration,
    /// Pause before reopening a failed watch or retrying a failed listing.
    pub retry_interval: Duration,
    /// Treat a stored `{}` as "no resource yet".
    pub empty_object_is_placeholder: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(5),
            empty_object_is_placeholder: true,
        }
    }
}

enum WatchOutcome {
    Shutdown,
    Failed(KvError),
}

/// Local replica of one resource type under a store prefix.
pub struct ResourceCache<R> {
    client: Arc<dyn KvStore>,
    key_prefix: String,
    settings: CacheSettings,
    entries: RwLock<HashMap<String, R>>,
    current_revision: AtomicI64,
    state: AtomicU8,
}

impl<R: ApisixResource> ResourceCache<R> {
    /// Build the cache for `prefix` (e.g. `/apisix/routes`) and run the initial full listing.
    pub async fn new(
        client: Arc<dyn KvStore>,
        prefix: &str,
        settings: CacheSettings,
    ) -> StoreResult<Arc<Self>> {
        if ResourceKind::from_prefix(prefix) != Some(R::KIND) {
            return Err(StoreError::UnknownResourceType(prefix.to_string()));
        }

        let cache = Arc::new(Self {
            client,
            key_prefix: format!("{}/", prefix.trim_end_matches('/')),
            settings,
            entries: RwLock::new(HashMap::new()),
            current_revision: AtomicI64::new(0),
            state: AtomicU8::new(CacheState::Uninitialized as u8),
        });

        cache.set_state(CacheState::FullSyncing);
        cache.full_sync().await?;

        tracing::info!(
            kind = %R::KIND,
            entries = cache.len(),
            revision = cache.revision(),
            "Resource cache initialized"
        );
        Ok(cache)
    }

    pub fn kind(&self) -> ResourceKind {
        R::KIND
    }

    pub fn state(&self) -> CacheState {
        CacheState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Last store revision reflected by the cache.
    pub fn revision(&self) -> i64 {
        self.current_revision.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.read().get(id).cloned()
    }

    /// Creation time of the cached resource `id`, if cached and stamped.
    pub fn create_time(&self, id: &str) -> Option<i64> {
        self.read().get(id).and_then(|resource| resource.create_time())
    }

    /// Snapshot of the resources belonging to `stage_key`.
    pub fn get_by_stage(&self, stage_key: &str) -> HashMap<String, R> {
        self.read()
            .iter()
            .filter(|(_, resource)| resource.stage_key() == stage_key)
            .map(|(id, resource)| (id.clone(), resource.clone()))
            .collect()
    }

    /// Snapshot of every cached resource.
    pub fn get_all(&self) -> HashMap<String, R> {
        self.read().clone()
    }

    /// Spawn the watch loop; it runs until `shutdown` fires.
    pub fn start_watch(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.watch_loop(shutdown).await })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, R>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, R>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn full_sync(&self) -> StoreResult<()> {
        let listing = tokio::time::timeout(
            self.settings.list_timeout,
            self.client.list(&self.key_prefix),
        )
        .await
        .map_err(|_| KvError::Timeout(self.settings.list_timeout))??;

        let entries: HashMap<String, R> = listing
            .kvs
            .iter()
            .filter_map(|kv| self.decode(&kv.key, &kv.value))
            .collect();

        *self.write() = entries;
        self.current_revision.store(listing.revision, Ordering::Release);
        Ok(())
    }

    fn is_placeholder(&self, value: &[u8]) -> bool {
        value == DIRECTORY_MARKER
            || (self.settings.empty_object_is_placeholder && value.trim_ascii() == EMPTY_OBJECT)
    }

    fn decode(&self, key: &str, value: &[u8]) -> Option<(String, R)> {
        let id = key.strip_prefix(&self.key_prefix).filter(|id| !id.is_empty())?;
        if self.is_placeholder(value) {
            return None;
        }
        match serde_json::from_slice::<R>(value) {
            Ok(resource) => Some((id.to_string(), resource)),
            Err(e) => {
                tracing::warn!(kind = %R::KIND, key = %key, error = %e, "Skipping undecodable resource");
                None
            }
        }
    }

    fn apply(&self, response: WatchResponse) {
        {
            let mut entries = self.write();
            for event in &response.events {
                match event.kind {
                    EventKind::Put => match self.decode(&event.key, &event.value) {
                        Some((id, resource)) => {
                            entries.insert(id, resource);
                        }
                        // The key no longer holds a usable resource.
                        None if event.value != DIRECTORY_MARKER => {
                            if let Some(id) = event.key.strip_prefix(&self.key_prefix) {
                                entries.remove(id);
                            }
                        }
                        None => {}
                    },
                    EventKind::Delete => {
                        if let Some(id) = event.key.strip_prefix(&self.key_prefix) {
                            entries.remove(id);
                        }
                    }
                }
            }
        }

        let latest = response
            .events
            .iter()
            .map(|event| event.mod_revision)
            .max()
            .unwrap_or(0)
            .max(response.revision);
        self.current_revision.fetch_max(latest, Ordering::AcqRel);
    }

    async fn watch_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let start_revision = self.revision() + 1;
            let outcome = match self.client.watch(&self.key_prefix, start_revision, true).await {
                Ok(stream) => {
                    self.set_state(CacheState::Watching);
                    tracing::debug!(kind = %R::KIND, start_revision, "Watch opened");
                    self.consume(stream, &mut shutdown).await
                }
                Err(e) => WatchOutcome::Failed(e),
            };

            let error = match outcome {
                WatchOutcome::Shutdown => break,
                WatchOutcome::Failed(error) => error,
            };
            tracing::warn!(
                kind = %R::KIND,
                revision = self.revision(),
                error = %error,
                "Watch channel failed, reconnecting"
            );

            if !self.pause(&mut shutdown).await {
                break;
            }
            if error.requires_resync() && !self.resync(&mut shutdown).await {
                break;
            }
        }
        tracing::info!(kind = %R::KIND, "Watch loop stopped");
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> WatchOutcome {
        loop {
            tokio::select! {
                item = stream.recv() => match item {
                    Some(Ok(response)) => self.apply(response),
                    Some(Err(e)) => return WatchOutcome::Failed(e),
                    None => return WatchOutcome::Failed(KvError::ChannelClosed),
                },
                _ = shutdown.recv() => return WatchOutcome::Shutdown,
            }
        }
    }

    /// Full listing until it succeeds; false if shut down meanwhile.
    async fn resync(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        loop {
            self.set_state(CacheState::Resyncing);
            metrics::record_cache_resync(R::KIND);
            match self.full_sync().await {
                Ok(()) => {
                    tracing::info!(
                        kind = %R::KIND,
                        entries = self.len(),
                        revision = self.revision(),
                        "Resource cache resynced"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::error!(kind = %R::KIND, error = %e, "Full resync failed, retrying");
                    if !self.pause(shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep the retry interval; false if shut down meanwhile.
    async fn pause(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_interval) => true,
            _ = shutdown.recv() => false,
        }
    }
}
