//! Configuration stores.
//!
//! # Data Flow
//! ```text
//! synchronizer flush
//!     → ApisixConfigStore::alter(changed stages, retry callback)
//!     → kv_store.rs: diff against resource caches, ordered puts then reverse-ordered deletes
//!     → kv.rs client (etcd.rs, or memory.rs in-process) writes keys <prefix>/<type>/<id>
//!     → cache.rs watch loops observe the writes
//!     → next get / get_all reflects the new state
//!
//! Alternate backend:
//!     → file.rs: merge all stages into one document, atomic rewrite
//! ```
//!
//! # Design Decisions
//! - One cache per resource type, each with its own watch loop
//! - A failed stage is handed back through the retry callback, never retried inline
//! - Reads never fail; they serve the last known cache state

pub mod cache;
pub mod error;
pub mod etcd;
pub mod file;
pub mod kv;
pub mod kv_store;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::apisix::ApisixConfiguration;

pub use cache::{CacheSettings, CacheState, ResourceCache};
pub use error::{StoreError, StoreResult};
pub use etcd::EtcdKvStore;
pub use file::FileConfigStore;
pub use kv::{KvError, KvStore};
pub use kv_store::{KvConfigStore, KvStoreSettings};
pub use memory::MemoryKvStore;

/// Seconds since the Unix epoch, used for resource timestamps.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Called with `(stage_key, desired)` when altering that stage failed.
pub type RetryCallback = Arc<dyn Fn(String, ApisixConfiguration) + Send + Sync>;

/// Store of the proxy configuration, partitioned by stage key.
#[async_trait]
pub trait ApisixConfigStore: Send + Sync {
    /// Current configuration of one stage.
    fn get(&self, stage_key: &str) -> ApisixConfiguration;

    /// Current configuration of every stage present in the store.
    fn get_all(&self) -> HashMap<String, ApisixConfiguration>;

    /// Converge each changed stage to its desired configuration.
    ///
    /// An empty configuration removes everything the stage owns. Stages that
    /// fail are passed to `on_failure` asynchronously and reported in the error.
    async fn alter(
        &self,
        changed: HashMap<String, ApisixConfiguration>,
        on_failure: RetryCallback,
    ) -> StoreResult<()>;

    /// Short backend name for status reporting.
    fn backend(&self) -> &'static str;
}
