//! Store adapter behaviour against the in-memory KV store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use apisix_sync::apisix::{ApisixConfiguration, Route, PLUGIN_METADATA_STAGE_KEY};
use apisix_sync::lifecycle::Shutdown;
use apisix_sync::store::kv::{KvResult, ListResponse, WatchStream};
use apisix_sync::store::memory::Operation;
use apisix_sync::store::{
    ApisixConfigStore, KvConfigStore, KvStore, MemoryKvStore, RetryCallback, StoreError,
};

mod common;

fn noop_retry() -> RetryCallback {
    Arc::new(|_, _| {})
}

fn kind_of(key: &str) -> &str {
    key.trim_start_matches("/apisix/").split('/').next().unwrap_or_default()
}

fn single(stage_key: &str, config: ApisixConfiguration) -> HashMap<String, ApisixConfiguration> {
    HashMap::from([(stage_key.to_string(), config)])
}

#[tokio::test]
async fn test_writes_follow_dependency_order_and_deletes_reverse_it() {
    let (kv, store, _shutdown) = common::start_store().await;

    let mut initial = common::stage_config("gw", "prod", &["old"]);
    initial.insert(common::ssl("gw", "prod", "old-cert"));
    initial.insert(common::service("gw", "prod", "old-svc"));
    store.alter(single("gw/prod", initial), noop_retry()).await.unwrap();
    common::wait_for(|| store.get("gw/prod").statistic().total() == 5).await;
    kv.clear_operations();

    let mut desired = common::stage_config("gw", "prod", &["new"]);
    desired.insert(common::ssl("gw", "prod", "new-cert"));
    desired.insert(common::metadata("file-logger", json!({"log_format": {"host": "$host"}})));
    store.alter(single("gw/prod", desired), noop_retry()).await.unwrap();

    let operations = kv.operations();
    let puts: Vec<&str> = operations
        .iter()
        .filter_map(|op| match op {
            Operation::Put(key) => Some(kind_of(key)),
            Operation::Delete(_) => None,
        })
        .collect();
    let deletes: Vec<&str> = operations
        .iter()
        .filter_map(|op| match op {
            Operation::Delete(key) => Some(kind_of(key)),
            Operation::Put(_) => None,
        })
        .collect();

    assert_eq!(puts, vec!["ssls", "plugin_metadata", "routes"]);
    assert_eq!(deletes, vec!["routes", "services", "ssls"]);

    let first_delete = operations
        .iter()
        .position(|op| matches!(op, Operation::Delete(_)))
        .unwrap();
    assert!(operations[..first_delete]
        .iter()
        .all(|op| matches!(op, Operation::Put(_))));
}

#[tokio::test]
async fn test_full_cycle_order_with_every_kind() {
    let (kv, store, _shutdown) = common::start_store().await;

    let mut desired = common::stage_config("gw", "prod", &["a"]);
    desired.insert(common::metadata("prometheus", json!({"prefer_name": true})));
    store
        .alter(single(PLUGIN_METADATA_STAGE_KEY, desired.clone()), noop_retry())
        .await
        .unwrap();

    let puts: Vec<String> = kv
        .operations()
        .iter()
        .map(|op| match op {
            Operation::Put(key) | Operation::Delete(key) => kind_of(key).to_string(),
        })
        .collect();
    assert_eq!(puts, vec!["ssls", "plugin_metadata", "services", "routes"]);

    common::wait_for(|| store.get(PLUGIN_METADATA_STAGE_KEY).plugin_metadata.len() == 1).await;
    common::wait_for(|| store.get("gw/prod").statistic().total() == 3).await;
    kv.clear_operations();

    store
        .alter(single(PLUGIN_METADATA_STAGE_KEY, ApisixConfiguration::new()), noop_retry())
        .await
        .unwrap();
    store
        .alter(single("gw/prod", ApisixConfiguration::new()), noop_retry())
        .await
        .unwrap();

    let deletes: Vec<String> = kv
        .operations()
        .iter()
        .map(|op| match op {
            Operation::Put(key) | Operation::Delete(key) => kind_of(key).to_string(),
        })
        .collect();
    assert_eq!(deletes, vec!["plugin_metadata", "routes", "services", "ssls"]);
}

#[tokio::test]
async fn test_update_preserves_create_time() {
    let kv = Arc::new(apisix_sync::store::MemoryKvStore::new());
    let mut seeded = common::route("gw", "prod", "users");
    seeded.create_time = Some(1_000);
    seeded.update_time = Some(1_000);
    kv.put(
        "/apisix/routes/gw.prod.users",
        serde_json::to_vec(&seeded).unwrap(),
    )
    .await
    .unwrap();
    let (kv, store, _shutdown) = common::start_store_over(kv).await;

    let mut changed = common::route("gw", "prod", "users");
    changed.uris = vec!["/v2/users".into()];
    let mut desired = ApisixConfiguration::new();
    desired.insert(changed);
    store.alter(single("gw/prod", desired), noop_retry()).await.unwrap();

    let raw = kv.get("/apisix/routes/gw.prod.users").unwrap();
    let stored: Route = serde_json::from_slice(&raw).unwrap();
    assert_eq!(stored.uris, vec!["/v2/users".to_string()]);
    assert_eq!(stored.create_time, Some(1_000));
    assert!(stored.update_time.unwrap() > 1_000);
}

#[tokio::test]
async fn test_unchanged_stage_writes_nothing() {
    let (kv, store, _shutdown) = common::start_store().await;
    let desired = common::stage_config("gw", "prod", &["a", "b"]);

    store
        .alter(single("gw/prod", desired.clone()), noop_retry())
        .await
        .unwrap();
    common::wait_for(|| store.get("gw/prod").routes.len() == 2).await;
    kv.clear_operations();

    store.alter(single("gw/prod", desired), noop_retry()).await.unwrap();
    assert!(kv.operations().is_empty());
}

#[tokio::test]
async fn test_failed_stage_is_isolated_and_handed_to_retry() {
    let (kv, store, _shutdown) = common::start_store().await;
    kv.fail_keys_matching("gw.bad.");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let retry: RetryCallback = Arc::new(move |stage_key, config| {
        let _ = tx.send((stage_key, config));
    });
    let changed = HashMap::from([
        ("gw/good".to_string(), common::stage_config("gw", "good", &["a"])),
        ("gw/bad".to_string(), common::stage_config("gw", "bad", &["a"])),
    ]);

    let err = store.alter(changed, retry).await.unwrap_err();
    match err {
        StoreError::StagesFailed { stages } => assert_eq!(stages, vec!["gw/bad".to_string()]),
        other => panic!("unexpected error {:?}", other),
    }

    let (stage_key, config) = rx.recv().await.unwrap();
    assert_eq!(stage_key, "gw/bad");
    assert_eq!(config.routes.len(), 1);

    assert!(kv.get("/apisix/routes/gw.good.a").is_some());
    assert!(kv.get("/apisix/ssls/gw.bad.cert").is_none());
    assert!(kv.get("/apisix/routes/gw.bad.a").is_none());
}

#[tokio::test]
async fn test_get_all_groups_by_stage() {
    let (_kv, store, _shutdown) = common::start_store().await;
    let changed = HashMap::from([
        ("gw/a".to_string(), common::stage_config("gw", "a", &["r1"])),
        ("gw/b".to_string(), common::stage_config("gw", "b", &["r1", "r2"])),
    ]);
    store.alter(changed, noop_retry()).await.unwrap();

    common::wait_for(|| store.get_all().len() == 2).await;
    common::wait_for(|| store.get("gw/b").routes.len() == 2).await;
    let all = store.get_all();
    assert_eq!(all["gw/a"].statistic().total(), 3);
    assert_eq!(all["gw/b"].statistic().total(), 4);
    assert_eq!(store.backend(), "kv");
}

/// Panics on writes to keys containing `pattern`.
struct PanickingKv {
    inner: MemoryKvStore,
    pattern: &'static str,
}

#[async_trait]
impl KvStore for PanickingKv {
    async fn list(&self, prefix: &str) -> KvResult<ListResponse> {
        self.inner.list(prefix).await
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: i64,
        require_leader: bool,
    ) -> KvResult<WatchStream> {
        self.inner.watch(prefix, start_revision, require_leader).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<i64> {
        if key.contains(self.pattern) {
            panic!("write to {} crashed", key);
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> KvResult<i64> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_crashed_stage_task_is_handed_to_retry() {
    let kv = Arc::new(PanickingKv {
        inner: MemoryKvStore::new(),
        pattern: "gw.boom.",
    });
    let shutdown = Shutdown::new();
    let store = KvConfigStore::new(kv.clone(), common::fast_settings(), &shutdown)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let retry: RetryCallback = Arc::new(move |stage_key, config| {
        let _ = tx.send((stage_key, config));
    });
    let changed = HashMap::from([
        ("gw/ok".to_string(), common::stage_config("gw", "ok", &["a"])),
        ("gw/boom".to_string(), common::stage_config("gw", "boom", &["a"])),
    ]);

    match store.alter(changed, retry).await.unwrap_err() {
        StoreError::StagesFailed { stages } => assert_eq!(stages, vec!["gw/boom".to_string()]),
        other => panic!("unexpected error {:?}", other),
    }

    let (stage_key, config) = rx.recv().await.unwrap();
    assert_eq!(stage_key, "gw/boom");
    assert_eq!(config.routes.len(), 1);
    assert!(kv.inner.get("/apisix/routes/gw.ok.a").is_some());

    shutdown.trigger();
}
