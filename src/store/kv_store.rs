//! Store adapter over a distributed key-value store.
//!
//! # Responsibilities
//! - Own one resource cache per type under a common prefix
//! - Assemble per-stage configurations from the caches
//! - Alter stages concurrently: diff, ordered writes, reverse-ordered deletes
//! - Preserve creation time across updates
//!
//! # Write Ordering
//! ```text
//! put:    ssls → plugin_metadata → services → (pause) → routes
//! delete: routes → services → plugin_metadata → ssls
//! ```
//! A route is never visible before the service or certificate it references,
//! and a dependency is never removed while a dependent still exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::apisix::{
    ApisixConfiguration, ApisixResource, PluginMetadata, ResourceKind, Route, Service, Ssl,
    PLUGIN_METADATA_STAGE_KEY,
};
use crate::diff::diff;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::store::cache::{CacheSettings, CacheState, ResourceCache};
use crate::store::error::{StoreError, StoreResult};
use crate::store::kv::{KvError, KvStore};
use crate::store::{unix_now, ApisixConfigStore, RetryCallback};

/// Tunables of the key-value backed store.
#[derive(Debug, Clone)]
pub struct KvStoreSettings {
    /// Key prefix of the proxy configuration (e.g. `/apisix`).
    pub prefix: String,
    pub cache: CacheSettings,
    /// Deadline of each put and delete.
    pub operation_timeout: Duration,
    /// Pause between writing services and writing the routes that use them.
    pub route_put_interval: Duration,
}

impl Default for KvStoreSettings {
    fn default() -> Self {
        Self {
            prefix: "/apisix".to_string(),
            cache: CacheSettings::default(),
            operation_timeout: Duration::from_secs(10),
            route_put_interval: Duration::from_millis(500),
        }
    }
}

/// Configuration store backed by a revisioned key-value store.
#[derive(Clone)]
pub struct KvConfigStore {
    client: Arc<dyn KvStore>,
    settings: KvStoreSettings,
    routes: Arc<ResourceCache<Route>>,
    services: Arc<ResourceCache<Service>>,
    ssls: Arc<ResourceCache<Ssl>>,
    plugin_metadata: Arc<ResourceCache<PluginMetadata>>,
}

impl KvConfigStore {
    /// Initialize all four caches and start their watch loops.
    ///
    /// Fails unless every cache completes its initial listing.
    pub async fn new(
        client: Arc<dyn KvStore>,
        settings: KvStoreSettings,
        shutdown: &Shutdown,
    ) -> StoreResult<Self> {
        let prefix = settings.prefix.trim_end_matches('/').to_string();
        let route_prefix = format!("{}/{}", prefix, ResourceKind::Route);
        let service_prefix = format!("{}/{}", prefix, ResourceKind::Service);
        let ssl_prefix = format!("{}/{}", prefix, ResourceKind::Ssl);
        let metadata_prefix = format!("{}/{}", prefix, ResourceKind::PluginMetadata);

        let (routes, services, ssls, plugin_metadata) = tokio::join!(
            ResourceCache::<Route>::new(client.clone(), &route_prefix, settings.cache.clone()),
            ResourceCache::<Service>::new(client.clone(), &service_prefix, settings.cache.clone()),
            ResourceCache::<Ssl>::new(client.clone(), &ssl_prefix, settings.cache.clone()),
            ResourceCache::<PluginMetadata>::new(
                client.clone(),
                &metadata_prefix,
                settings.cache.clone()
            ),
        );

        let (routes, services, ssls, plugin_metadata) = match (routes, services, ssls, plugin_metadata) {
            (Ok(routes), Ok(services), Ok(ssls), Ok(plugin_metadata)) => {
                (routes, services, ssls, plugin_metadata)
            }
            (routes, services, ssls, plugin_metadata) => {
                let errors: Vec<StoreError> = [
                    routes.err(),
                    services.err(),
                    ssls.err(),
                    plugin_metadata.err(),
                ]
                .into_iter()
                .flatten()
                .collect();
                for e in &errors {
                    tracing::error!(error = %e, "Resource cache failed to initialize");
                }
                return Err(StoreError::IncompleteCaches {
                    initialized: 4 - errors.len(),
                });
            }
        };

        routes.start_watch(shutdown.subscribe());
        services.start_watch(shutdown.subscribe());
        ssls.start_watch(shutdown.subscribe());
        plugin_metadata.start_watch(shutdown.subscribe());

        tracing::info!(prefix = %prefix, "KV config store ready");
        Ok(Self {
            client,
            settings: KvStoreSettings { prefix, ..settings },
            routes,
            services,
            ssls,
            plugin_metadata,
        })
    }

    /// Lifecycle state of each cache.
    pub fn cache_states(&self) -> Vec<(ResourceKind, CacheState)> {
        vec![
            (self.routes.kind(), self.routes.state()),
            (self.services.kind(), self.services.state()),
            (self.ssls.kind(), self.ssls.state()),
            (self.plugin_metadata.kind(), self.plugin_metadata.state()),
        ]
    }

    fn resource_key(&self, kind: ResourceKind, id: &str) -> String {
        format!("{}/{}/{}", self.settings.prefix, kind.as_str(), id)
    }

    /// Cached state to diff a stage against.
    ///
    /// Plugin metadata is process-wide: a stage other than the metadata stage
    /// is compared only against the cached entries it names, and never deletes.
    fn current_state(&self, stage_key: &str, desired: &ApisixConfiguration) -> ApisixConfiguration {
        let mut current = self.get(stage_key);
        if stage_key != PLUGIN_METADATA_STAGE_KEY {
            current.plugin_metadata = desired
                .plugin_metadata
                .keys()
                .filter_map(|id| self.plugin_metadata.get(id).map(|m| (id.clone(), m)))
                .collect();
        }
        current
    }

    async fn alter_stage(&self, stage_key: &str, desired: &ApisixConfiguration) -> StoreResult<()> {
        let current = self.current_state(stage_key, desired);
        let changes = diff(&current, desired);
        if changes.is_empty() {
            tracing::debug!(stage_key = %stage_key, "Stage already converged");
            return Ok(());
        }

        if !changes.put.is_empty() {
            self.put_resources(&changes.put).await?;
        }
        if !changes.delete.is_empty() {
            self.delete_resources(&changes.delete).await?;
        }

        tracing::info!(
            stage_key = %stage_key,
            put = ?changes.put.statistic(),
            delete = ?changes.delete.statistic(),
            "Stage altered"
        );
        Ok(())
    }

    async fn put_resources(&self, put: &ApisixConfiguration) -> StoreResult<()> {
        self.put_kind(&self.ssls, &put.ssls).await?;
        self.put_kind(&self.plugin_metadata, &put.plugin_metadata).await?;
        self.put_kind(&self.services, &put.services).await?;

        if !put.routes.is_empty() {
            if !put.services.is_empty() && !self.settings.route_put_interval.is_zero() {
                tokio::time::sleep(self.settings.route_put_interval).await;
            }
            self.put_kind(&self.routes, &put.routes).await?;
        }
        Ok(())
    }

    async fn delete_resources(&self, delete: &ApisixConfiguration) -> StoreResult<()> {
        self.delete_kind(&delete.routes).await?;
        self.delete_kind(&delete.services).await?;
        self.delete_kind(&delete.plugin_metadata).await?;
        self.delete_kind(&delete.ssls).await
    }

    async fn put_kind<R: ApisixResource>(
        &self,
        cache: &ResourceCache<R>,
        resources: &HashMap<String, R>,
    ) -> StoreResult<()> {
        let now = unix_now();
        for (id, resource) in sorted(resources) {
            let mut resource = resource.clone();
            resource.set_create_time(cache.create_time(id).unwrap_or(now));
            resource.set_update_time(now);

            let value = serde_json::to_vec(&resource)?;
            let key = self.resource_key(R::KIND, id);
            let started = Instant::now();
            let result = self.with_timeout(self.client.put(&key, value)).await;
            metrics::record_store_operation(R::KIND, "put", result.is_ok(), started);
            result?;

            let (gateway, stage) = resource.gateway_and_stage();
            metrics::record_resource_written(gateway, stage, R::KIND);
            tracing::debug!(key = %key, "Resource written");
        }
        Ok(())
    }

    async fn delete_kind<R: ApisixResource>(&self, resources: &HashMap<String, R>) -> StoreResult<()> {
        for (id, _) in sorted(resources) {
            let key = self.resource_key(R::KIND, id);
            let started = Instant::now();
            let result = self.with_timeout(self.client.delete(&key)).await;
            metrics::record_store_operation(R::KIND, "delete", result.is_ok(), started);
            result?;
            tracing::debug!(key = %key, "Resource deleted");
        }
        Ok(())
    }

    async fn with_timeout<F>(&self, operation: F) -> Result<i64, KvError>
    where
        F: std::future::Future<Output = Result<i64, KvError>>,
    {
        let limit = self.settings.operation_timeout;
        tokio::time::timeout(limit, operation)
            .await
            .unwrap_or(Err(KvError::Timeout(limit)))
    }
}

/// Hand a failed stage to `on_failure` without blocking the caller.
fn retry_later(stage_key: String, desired: ApisixConfiguration, on_failure: RetryCallback) {
    metrics::record_stage_retry(&stage_key);
    tokio::spawn(async move { on_failure(stage_key, desired) });
}

fn sorted<R>(resources: &HashMap<String, R>) -> Vec<(&String, &R)> {
    let mut entries: Vec<_> = resources.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    entries
}

#[async_trait]
impl ApisixConfigStore for KvConfigStore {
    fn get(&self, stage_key: &str) -> ApisixConfiguration {
        ApisixConfiguration {
            routes: self.routes.get_by_stage(stage_key),
            services: self.services.get_by_stage(stage_key),
            ssls: self.ssls.get_by_stage(stage_key),
            plugin_metadata: self.plugin_metadata.get_by_stage(stage_key),
        }
    }

    fn get_all(&self) -> HashMap<String, ApisixConfiguration> {
        ApisixConfiguration {
            routes: self.routes.get_all(),
            services: self.services.get_all(),
            ssls: self.ssls.get_all(),
            plugin_metadata: self.plugin_metadata.get_all(),
        }
        .group_by_stage()
    }

    async fn alter(
        &self,
        changed: HashMap<String, ApisixConfiguration>,
        on_failure: RetryCallback,
    ) -> StoreResult<()> {
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::with_capacity(changed.len());
        for (stage_key, desired) in changed {
            let store = self.clone();
            let on_failure = on_failure.clone();
            let task_stage = (stage_key.clone(), desired.clone());
            let handle = tasks.spawn(async move {
                let result = store.alter_stage(&stage_key, &desired).await;
                match result {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::error!(stage_key = %stage_key, error = %e, "Failed to alter stage");
                        retry_later(stage_key.clone(), desired, on_failure);
                        Some(stage_key)
                    }
                }
            });
            in_flight.insert(handle.id(), task_stage);
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    failed.extend(outcome);
                }
                Err(e) => {
                    let Some((stage_key, desired)) = in_flight.remove(&e.id()) else {
                        continue;
                    };
                    tracing::error!(stage_key = %stage_key, error = %e, "Stage alter task aborted");
                    retry_later(stage_key.clone(), desired, on_failure.clone());
                    failed.push(stage_key);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort_unstable();
            Err(StoreError::StagesFailed { stages: failed })
        }
    }

    fn backend(&self) -> &'static str {
        "kv"
    }
}
