//! Distributed key-value store client contract.
//!
//! # Responsibilities
//! - Prefix listing that reports the store revision it reflects
//! - Prefix watches resumable from a revision, with require-leader semantics
//! - Single-key put and delete
//!
//! # Design Decisions
//! - Watch streams are channels; an `Err` item ends the stream
//! - Compaction and future-revision failures are distinct variants because
//!   both force the caller back to a full listing

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by a key-value store client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// The requested revision has been compacted away.
    #[error("required revision {requested} has been compacted (compact revision {compact_revision})")]
    Compacted { requested: i64, compact_revision: i64 },

    /// The requested revision is ahead of the store.
    #[error("required revision {requested} is a future revision (current {current})")]
    FutureRevision { requested: i64, current: i64 },

    /// The cluster has no leader; require-leader watches are cancelled.
    #[error("no leader")]
    NoLeader,

    /// Connection or server failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation deadline exceeded.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Watch channel closed by the server.
    #[error("watch channel closed")]
    ChannelClosed,
}

impl KvError {
    /// True if resuming from the last observed revision is impossible.
    pub fn requires_resync(&self) -> bool {
        matches!(self, KvError::Compacted { .. } | KvError::FutureRevision { .. })
    }
}

/// Result type for key-value store operations.
pub type KvResult<T> = Result<T, KvError>;

/// One stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// Result of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision the listing reflects.
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// A batch of events delivered together.
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    /// Store revision when the batch was sent.
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// Receiving half of a watch.
pub type WatchStream = mpsc::UnboundedReceiver<KvResult<WatchResponse>>;

/// Client of a revisioned key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// List every key under `prefix`.
    async fn list(&self, prefix: &str) -> KvResult<ListResponse>;

    /// Watch `prefix` for changes with `mod_revision >= start_revision`.
    async fn watch(
        &self,
        prefix: &str,
        start_revision: i64,
        require_leader: bool,
    ) -> KvResult<WatchStream>;

    /// Write `key`, returning the new store revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<i64>;

    /// Remove `key`, returning the store revision after the call.
    async fn delete(&self, key: &str) -> KvResult<i64>;
}
