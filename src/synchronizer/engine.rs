//! Buffering synchronizer between producers and the config store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::apisix::{build_stage_key, ApisixConfiguration, PLUGIN_METADATA_STAGE_KEY};
use crate::observability::metrics;
use crate::store::{ApisixConfigStore, RetryCallback, StoreResult};
use crate::synchronizer::buffer::DoubleBuffer;
use crate::synchronizer::virtual_stage::VirtualStage;

/// Coalesces per-stage desired state and flushes it to the store.
pub struct ApisixConfigSynchronizer {
    store: Arc<dyn ApisixConfigStore>,
    buffers: DoubleBuffer,
    flush_lock: Mutex<()>,
    virtual_stage: VirtualStage,
    this: Weak<Self>,
}

impl ApisixConfigSynchronizer {
    pub fn new(store: Arc<dyn ApisixConfigStore>, virtual_stage: VirtualStage) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            buffers: DoubleBuffer::new(),
            flush_lock: Mutex::new(()),
            virtual_stage,
            this: this.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn ApisixConfigStore> {
        &self.store
    }

    pub fn virtual_stage_key(&self) -> String {
        self.virtual_stage.stage_key()
    }

    /// Stages waiting for the next flush.
    pub fn pending_stages(&self) -> usize {
        self.buffers.pending()
    }

    /// Queue `config` as the desired state of `gateway`/`stage`.
    pub fn sync(&self, gateway: &str, stage: &str, config: ApisixConfiguration) {
        let stage_key = build_stage_key(gateway, stage);
        self.buffers.with_active(|buffer| buffer.put(stage_key, config));
        metrics::record_sync_event(gateway, stage);
    }

    /// Re-queue a stage whose alter failed, unless fresher state is pending.
    pub fn resync(&self, stage_key: String, config: ApisixConfiguration) {
        let queued = self
            .buffers
            .with_active(|buffer| buffer.put_if_absent(stage_key.clone(), config));
        if queued {
            tracing::info!(stage_key = %stage_key, "Stage queued for retry");
        } else {
            tracing::debug!(stage_key = %stage_key, "Newer pending state supersedes retry");
        }
    }

    /// Callback handed to the store for failed stages.
    pub fn retry_callback(&self) -> RetryCallback {
        let this = self.this.clone();
        Arc::new(move |stage_key, config| {
            if let Some(synchronizer) = this.upgrade() {
                synchronizer.resync(stage_key, config);
            }
        })
    }

    /// Trigger a flush in the background.
    pub fn flush(&self) {
        let Some(synchronizer) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _ = synchronizer.flush_now().await;
        });
    }

    /// Flush pending stages, then refresh the virtual stage.
    ///
    /// Writers are redirected to the other buffer before the store is
    /// touched, so `sync` never waits on a slow alter.
    pub async fn flush_now(&self) -> StoreResult<()> {
        let _flush = self.flush_lock.lock().await;
        let started = Instant::now();

        let changed = self.buffers.swap().drain();
        let stages = changed.len();
        let pending_result = if changed.is_empty() {
            tracing::debug!("No pending stages, skipping alter");
            Ok(())
        } else {
            self.store.alter(changed, self.retry_callback()).await
        };

        let virtual_config = HashMap::from([(
            self.virtual_stage.stage_key(),
            self.virtual_stage.make_configuration(),
        )]);
        let virtual_result = self.store.alter(virtual_config, self.retry_callback()).await;

        let result = pending_result.and(virtual_result);
        metrics::record_flush(result.is_ok(), started);
        match &result {
            Ok(()) => tracing::info!(
                stages,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Flush completed"
            ),
            Err(e) => tracing::warn!(stages, error = %e, "Flush completed with failures"),
        }
        result
    }

    /// Clear every stored stage not named in `existing`.
    ///
    /// The virtual stage and the plugin-metadata stage are never removed.
    pub async fn remove_not_exist_stage(&self, existing: &[String]) -> StoreResult<()> {
        let _flush = self.flush_lock.lock().await;

        let virtual_key = self.virtual_stage.stage_key();
        let removed: HashMap<String, ApisixConfiguration> = self
            .store
            .get_all()
            .into_keys()
            .filter(|key| !existing.contains(key))
            .filter(|key| key != &virtual_key && key != PLUGIN_METADATA_STAGE_KEY)
            .map(|key| (key, ApisixConfiguration::new()))
            .collect();

        if removed.is_empty() {
            return Ok(());
        }
        let mut keys: Vec<&String> = removed.keys().collect();
        keys.sort_unstable();
        tracing::info!(stages = ?keys, "Removing stages absent from desired state");

        self.store.alter(removed, self.retry_callback()).await
    }

    /// Queue every stage of a desired-state document, then clear stored stages it omits.
    ///
    /// Plugin metadata is process-wide: what the stages and an optional
    /// `default` entry name is queued as the metadata stage, so metadata
    /// missing from the document is deleted.
    pub async fn apply_desired_state(
        &self,
        state: HashMap<String, ApisixConfiguration>,
    ) -> StoreResult<()> {
        let mut metadata = ApisixConfiguration::new();
        let mut existing = Vec::with_capacity(state.len());
        for (stage_key, mut config) in state {
            metadata
                .plugin_metadata
                .extend(std::mem::take(&mut config.plugin_metadata));
            if stage_key == PLUGIN_METADATA_STAGE_KEY {
                if !config.is_empty() {
                    tracing::warn!(
                        stage_key = %stage_key,
                        "Ignoring non-metadata resources of the plugin metadata stage"
                    );
                }
                continue;
            }
            match stage_key.split_once('/') {
                Some((gateway, stage)) if !gateway.is_empty() && !stage.is_empty() => {
                    self.sync(gateway, stage, config);
                    existing.push(stage_key);
                }
                _ => tracing::warn!(stage_key = %stage_key, "Ignoring malformed stage key"),
            }
        }

        self.buffers
            .with_active(|buffer| buffer.put(PLUGIN_METADATA_STAGE_KEY.to_string(), metadata));
        self.remove_not_exist_stage(&existing).await
    }

    /// Flush every `interval` until `shutdown` fires, then flush once more.
    pub fn spawn_flush_loop(
        &self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        let synchronizer = self.this.upgrade()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "Flush loop starting");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = synchronizer.flush_now().await;
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Flush loop received shutdown signal, final flush");
                        let _ = synchronizer.flush_now().await;
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::apisix::{PluginMetadata, Route, GATEWAY_LABEL, STAGE_LABEL};
    use crate::store::StoreError;

    #[derive(Default)]
    struct RecordingStore {
        existing: StdMutex<HashMap<String, ApisixConfiguration>>,
        altered: StdMutex<Vec<HashMap<String, ApisixConfiguration>>>,
        fail: StdMutex<bool>,
    }

    impl RecordingStore {
        fn calls(&self) -> Vec<HashMap<String, ApisixConfiguration>> {
            self.altered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApisixConfigStore for RecordingStore {
        fn get(&self, stage_key: &str) -> ApisixConfiguration {
            self.existing
                .lock()
                .unwrap()
                .get(stage_key)
                .cloned()
                .unwrap_or_default()
        }

        fn get_all(&self) -> HashMap<String, ApisixConfiguration> {
            self.existing.lock().unwrap().clone()
        }

        async fn alter(
            &self,
            changed: HashMap<String, ApisixConfiguration>,
            on_failure: RetryCallback,
        ) -> StoreResult<()> {
            self.altered.lock().unwrap().push(changed.clone());
            if *self.fail.lock().unwrap() {
                let stages: Vec<String> = changed.keys().cloned().collect();
                for (stage_key, config) in changed {
                    on_failure(stage_key, config);
                }
                return Err(StoreError::StagesFailed { stages });
            }
            Ok(())
        }

        fn backend(&self) -> &'static str {
            "recording"
        }
    }

    fn config_with_route(gateway: &str, stage: &str, id: &str) -> ApisixConfiguration {
        let mut route = Route {
            id: id.into(),
            ..Default::default()
        };
        route.labels.insert(GATEWAY_LABEL.into(), gateway.into());
        route.labels.insert(STAGE_LABEL.into(), stage.into());
        let mut config = ApisixConfiguration::new();
        config.insert(route);
        config
    }

    fn setup() -> (Arc<RecordingStore>, Arc<ApisixConfigSynchronizer>) {
        let store = Arc::new(RecordingStore::default());
        let synchronizer = ApisixConfigSynchronizer::new(store.clone(), VirtualStage::default());
        (store, synchronizer)
    }

    #[tokio::test]
    async fn test_flush_sends_pending_then_virtual_stage() {
        let (store, synchronizer) = setup();
        synchronizer.sync("gw", "prod", config_with_route("gw", "prod", "r1"));
        synchronizer.sync("gw", "prod", config_with_route("gw", "prod", "r2"));

        synchronizer.flush_now().await.unwrap();

        let calls = store.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0]["gw/prod"].routes.contains_key("r2"));
        assert!(calls[1].contains_key(&synchronizer.virtual_stage_key()));
        assert_eq!(synchronizer.pending_stages(), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_only_refreshes_virtual_stage() {
        let (store, synchronizer) = setup();
        synchronizer.flush_now().await.unwrap();

        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        assert!(calls[0].contains_key("-/-"));
    }

    #[tokio::test]
    async fn test_resync_never_clobbers_fresher_sync() {
        let (store, synchronizer) = setup();
        synchronizer.sync("gw", "prod", config_with_route("gw", "prod", "fresh"));
        synchronizer.resync("gw/prod".into(), config_with_route("gw", "prod", "stale"));

        synchronizer.flush_now().await.unwrap();

        let flushed = &store.calls()[0]["gw/prod"];
        assert!(flushed.routes.contains_key("fresh"));
        assert!(!flushed.routes.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_failed_stage_is_retried_next_flush() {
        let (store, synchronizer) = setup();
        *store.fail.lock().unwrap() = true;
        synchronizer.sync("gw", "prod", config_with_route("gw", "prod", "r1"));

        assert!(synchronizer.flush_now().await.is_err());
        assert!(synchronizer.pending_stages() >= 1);

        *store.fail.lock().unwrap() = false;
        synchronizer.flush_now().await.unwrap();

        let calls = store.calls();
        let retried = calls.iter().skip(2).find(|call| call.contains_key("gw/prod"));
        assert!(retried.is_some());
    }

    #[tokio::test]
    async fn test_remove_not_exist_stage_alters_only_missing() {
        let (store, synchronizer) = setup();
        {
            let mut existing = store.existing.lock().unwrap();
            for key in ["gw/a", "gw/b", "gw/c", "-/-", PLUGIN_METADATA_STAGE_KEY] {
                existing.insert(key.to_string(), ApisixConfiguration::new());
            }
        }

        synchronizer
            .remove_not_exist_stage(&["gw/a".to_string(), "gw/c".to_string()])
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0]["gw/b"], ApisixConfiguration::new());
    }

    #[tokio::test]
    async fn test_remove_not_exist_stage_noop_when_all_present() {
        let (store, synchronizer) = setup();
        store
            .existing
            .lock()
            .unwrap()
            .insert("gw/a".into(), ApisixConfiguration::new());

        synchronizer.remove_not_exist_stage(&["gw/a".to_string()]).await.unwrap();
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_desired_state() {
        let (store, synchronizer) = setup();
        store
            .existing
            .lock()
            .unwrap()
            .insert("gw/old".into(), config_with_route("gw", "old", "r0"));

        let state = HashMap::from([
            ("gw/prod".to_string(), config_with_route("gw", "prod", "r1")),
            ("malformed".to_string(), ApisixConfiguration::new()),
        ]);
        synchronizer.apply_desired_state(state).await.unwrap();

        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].keys().collect::<Vec<_>>(), vec!["gw/old"]);
        assert_eq!(synchronizer.pending_stages(), 2);
    }

    #[tokio::test]
    async fn test_desired_state_metadata_is_queued_as_metadata_stage() {
        let (store, synchronizer) = setup();

        let mut prod = config_with_route("gw", "prod", "r1");
        prod.insert(PluginMetadata {
            id: "file-logger".into(),
            ..Default::default()
        });
        let mut defaults = ApisixConfiguration::new();
        defaults.insert(PluginMetadata {
            id: "prometheus".into(),
            ..Default::default()
        });
        let state = HashMap::from([
            ("gw/prod".to_string(), prod),
            (PLUGIN_METADATA_STAGE_KEY.to_string(), defaults),
        ]);
        synchronizer.apply_desired_state(state).await.unwrap();
        synchronizer.flush_now().await.unwrap();

        let flushed = &store.calls()[0];
        assert!(flushed["gw/prod"].plugin_metadata.is_empty());
        let mut names: Vec<&String> = flushed[PLUGIN_METADATA_STAGE_KEY]
            .plugin_metadata
            .keys()
            .collect();
        names.sort();
        assert_eq!(names, vec!["file-logger", "prometheus"]);

        synchronizer
            .apply_desired_state(HashMap::from([(
                "gw/prod".to_string(),
                config_with_route("gw", "prod", "r1"),
            )]))
            .await
            .unwrap();
        synchronizer.flush_now().await.unwrap();

        let calls = store.calls();
        let latest = calls
            .iter()
            .rev()
            .find(|call| call.contains_key(PLUGIN_METADATA_STAGE_KEY))
            .unwrap();
        assert!(latest[PLUGIN_METADATA_STAGE_KEY].plugin_metadata.is_empty());
    }

    #[tokio::test]
    async fn test_flush_loop_flushes_on_shutdown() {
        let (store, synchronizer) = setup();
        let (tx, rx) = broadcast::channel(1);
        let handle = synchronizer
            .spawn_flush_loop(Duration::from_secs(3600), rx)
            .unwrap();

        synchronizer.sync("gw", "prod", config_with_route("gw", "prod", "r1"));
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(store.calls().iter().any(|call| call.contains_key("gw/prod")));
    }
}
