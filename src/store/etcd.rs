//! etcd v3 client behind the `KvStore` contract.
//!
//! # Responsibilities
//! - Prefix listing through a ranged get, reporting the header revision
//! - Prefix watches from a start revision, forwarded into a `WatchStream`
//! - Map etcd failures onto `KvError`, keeping compaction and future
//!   revisions distinct so caches fall back to a full listing
//!
//! # Design Decisions
//! - Two connections: watches go through one opened with require-leader,
//!   so a partitioned member cancels them instead of serving stale history
//! - Watch responses without events (creation, progress) are not forwarded;
//!   a batch's revision is the highest `mod_revision` it carries

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, WatchOptions,
    WatchResponse as EtcdWatchResponse,
};
use tokio::sync::mpsc;

use crate::store::kv::{
    EventKind, KeyValue, KvError, KvResult, KvStore, ListResponse, WatchEvent, WatchResponse,
    WatchStream,
};

/// `KvStore` over an etcd v3 cluster.
pub struct EtcdKvStore {
    client: Client,
    leader_client: Client,
}

impl EtcdKvStore {
    /// Connect to `endpoints` (e.g. `http://127.0.0.1:2379`).
    pub async fn connect(endpoints: &[String], connect_timeout: Duration) -> KvResult<Self> {
        let options = || ConnectOptions::new().with_connect_timeout(connect_timeout);
        let client = Client::connect(endpoints, Some(options()))
            .await
            .map_err(|e| classify(&e.to_string(), 0))?;
        let leader_client = Client::connect(endpoints, Some(options().with_require_leader(true)))
            .await
            .map_err(|e| classify(&e.to_string(), 0))?;

        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self {
            client,
            leader_client,
        })
    }
}

/// Map an etcd error message onto the store error it stands for.
fn classify(message: &str, requested: i64) -> KvError {
    if message.contains("future revision") {
        KvError::FutureRevision {
            requested,
            current: 0,
        }
    } else if message.contains("compacted") {
        KvError::Compacted {
            requested,
            compact_revision: 0,
        }
    } else if message.contains("no leader") {
        KvError::NoLeader
    } else {
        KvError::Unavailable(message.to_string())
    }
}

/// Error ending a watch that the server cancelled.
fn cancel_error(compact_revision: i64, reason: &str, requested: i64) -> KvError {
    if compact_revision > 0 {
        return KvError::Compacted {
            requested,
            compact_revision,
        };
    }
    if reason.is_empty() {
        return KvError::ChannelClosed;
    }
    classify(reason, requested)
}

/// Convert one etcd watch response; `Ok(None)` when it carries no events.
fn translate(response: &EtcdWatchResponse, requested: i64) -> KvResult<Option<WatchResponse>> {
    if response.compact_revision() > 0 || response.canceled() {
        return Err(cancel_error(
            response.compact_revision(),
            response.cancel_reason(),
            requested,
        ));
    }

    let events: Vec<WatchEvent> = response
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let (kind, value) = match event.event_type() {
                EventType::Put => (EventKind::Put, kv.value().to_vec()),
                EventType::Delete => (EventKind::Delete, Vec::new()),
            };
            Some(WatchEvent {
                kind,
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value,
                mod_revision: kv.mod_revision(),
            })
        })
        .collect();

    let Some(revision) = events.iter().map(|event| event.mod_revision).max() else {
        return Ok(None);
    };
    Ok(Some(WatchResponse { revision, events }))
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn list(&self, prefix: &str) -> KvResult<ListResponse> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| classify(&e.to_string(), 0))?;

        let kvs = response
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect();
        Ok(ListResponse {
            kvs,
            revision: response.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: i64,
        require_leader: bool,
    ) -> KvResult<WatchStream> {
        let mut client = if require_leader {
            self.leader_client.clone()
        } else {
            self.client.clone()
        };
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| classify(&e.to_string(), start_revision))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => {
                        let item = match message {
                            Ok(Some(response)) => translate(&response, start_revision),
                            Ok(None) => Err(KvError::ChannelClosed),
                            Err(e) => Err(classify(&e.to_string(), start_revision)),
                        };
                        match item {
                            Ok(Some(batch)) => {
                                if tx.send(Ok(batch)).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                break;
                            }
                        }
                    }
                }
            }
            if let Err(e) = watcher.cancel().await {
                tracing::debug!(prefix = %prefix, error = %e, "Failed to cancel etcd watch");
            }
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<i64> {
        let mut client = self.client.clone();
        let response = client
            .put(key, value, None)
            .await
            .map_err(|e| classify(&e.to_string(), 0))?;
        Ok(response.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> KvResult<i64> {
        let mut client = self.client.clone();
        let response = client
            .delete(key, None)
            .await
            .map_err(|e| classify(&e.to_string(), 0))?;
        Ok(response.header().map(|h| h.revision()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_messages_map_to_store_errors() {
        assert_eq!(
            classify("etcdserver: mvcc: required revision is a future revision", 42),
            KvError::FutureRevision {
                requested: 42,
                current: 0
            }
        );
        assert!(classify("etcdserver: mvcc: required revision has been compacted", 7).requires_resync());
        assert_eq!(classify("etcdserver: no leader", 0), KvError::NoLeader);
        assert!(matches!(
            classify("transport error", 0),
            KvError::Unavailable(message) if message == "transport error"
        ));
    }

    #[test]
    fn test_cancelled_watch_reports_compaction() {
        assert_eq!(
            cancel_error(120, "", 100),
            KvError::Compacted {
                requested: 100,
                compact_revision: 120
            }
        );
        assert_eq!(cancel_error(0, "", 100), KvError::ChannelClosed);
        assert!(cancel_error(0, "mvcc: required revision is a future revision", 100).requires_resync());
        assert!(!cancel_error(0, "permission denied", 100).requires_resync());
    }
}
