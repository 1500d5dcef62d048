//! Flat-file configuration store for the proxy's standalone mode.
//!
//! # Responsibilities
//! - Hold the merged configuration of every stage in memory
//! - Render it as one YAML document terminated by `#END`
//! - Replace the document atomically on every alter
//! - Reload and regroup an existing document on startup
//!
//! # Design Decisions
//! - Temp file in the same directory, then rename, so readers never see a partial document
//! - A failed write leaves memory untouched and hands every changed stage back for retry
//! - Plugin metadata follows the key-value store rules: only the metadata stage deletes it

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::apisix::{
    ApisixConfiguration, ApisixResource, PluginMetadata, ResourceKind, Route, Service, Ssl,
    PLUGIN_METADATA_STAGE_KEY,
};
use crate::diff::resources_equivalent;
use crate::observability::metrics;
use crate::store::error::{StoreError, StoreResult};
use crate::store::{unix_now, ApisixConfigStore, RetryCallback};

/// Marker the proxy requires at the end of a standalone document.
const END_MARKER: &str = "#END";

/// On-disk layout: one list per resource type.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StandaloneDocument {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    services: Vec<Service>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssls: Vec<Ssl>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    plugin_metadata: Vec<PluginMetadata>,
}

impl StandaloneDocument {
    fn from_configuration(config: &ApisixConfiguration) -> Self {
        Self {
            routes: sorted_values(&config.routes),
            services: sorted_values(&config.services),
            ssls: sorted_values(&config.ssls),
            plugin_metadata: sorted_values(&config.plugin_metadata),
        }
    }

    fn into_configuration(self) -> ApisixConfiguration {
        let mut config = ApisixConfiguration::new();
        self.routes.into_iter().for_each(|r| config.insert(r));
        self.services.into_iter().for_each(|s| config.insert(s));
        self.ssls.into_iter().for_each(|s| config.insert(s));
        self.plugin_metadata.into_iter().for_each(|m| config.insert(m));
        config
    }
}

fn sorted_values<R: Clone>(resources: &HashMap<String, R>) -> Vec<R> {
    let mut entries: Vec<_> = resources.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, r)| r.clone()).collect()
}

/// Configuration store writing a standalone YAML document.
pub struct FileConfigStore {
    path: PathBuf,
    current: Mutex<ApisixConfiguration>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileConfigStore {
    /// Open the store at `path`, loading the document if it already exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_document(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ApisixConfiguration::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            resources = current.statistic().total(),
            "File config store opened"
        );
        Ok(Self {
            path,
            current: Mutex::new(current),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ApisixConfiguration> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write_document(&self, config: &ApisixConfiguration) -> StoreResult<()> {
        let rendered = render_document(config)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "apisix.yaml".to_string());
        let temp_path = dir.join(format!(".{}.tmp", file_name));

        tokio::fs::write(&temp_path, rendered).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn parse_document(content: &str) -> StoreResult<ApisixConfiguration> {
    let body = content.trim_end().trim_end_matches(END_MARKER);
    let has_content = body
        .lines()
        .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'));
    if !has_content {
        return Ok(ApisixConfiguration::new());
    }
    let document: StandaloneDocument = serde_yaml::from_str(body)?;
    Ok(document.into_configuration())
}

fn render_document(config: &ApisixConfiguration) -> StoreResult<String> {
    let document = StandaloneDocument::from_configuration(config);
    let mut rendered = if config.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(&document)?
    };
    rendered.push_str(END_MARKER);
    rendered.push('\n');
    Ok(rendered)
}

/// Replace `stage_key`'s slice of `current` with `desired`.
fn apply_stage(
    current: &mut ApisixConfiguration,
    stage_key: &str,
    desired: ApisixConfiguration,
    now: i64,
) {
    let previous = current.clone();
    current.routes.retain(|_, r| r.stage_key() != stage_key);
    current.services.retain(|_, s| s.stage_key() != stage_key);
    current.ssls.retain(|_, s| s.stage_key() != stage_key);
    if stage_key == PLUGIN_METADATA_STAGE_KEY {
        current.plugin_metadata.clear();
    }

    stamp_into(current, &previous, desired.routes, now);
    stamp_into(current, &previous, desired.services, now);
    stamp_into(current, &previous, desired.ssls, now);
    stamp_into(current, &previous, desired.plugin_metadata, now);
}

/// Insert `desired`, reusing unchanged entries and preserving creation time.
fn stamp_into<R: ApisixResource>(
    current: &mut ApisixConfiguration,
    previous: &ApisixConfiguration,
    desired: HashMap<String, R>,
    now: i64,
) {
    for (id, mut resource) in desired {
        let existing = R::select(previous).get(&id);
        if let Some(existing) = existing {
            if resources_equivalent(existing, &resource) {
                R::select_mut(current).insert(id, existing.clone());
                continue;
            }
        }
        resource.set_create_time(existing.and_then(|e| e.create_time()).unwrap_or(now));
        resource.set_update_time(now);
        R::select_mut(current).insert(id, resource);
    }
}

#[async_trait]
impl ApisixConfigStore for FileConfigStore {
    fn get(&self, stage_key: &str) -> ApisixConfiguration {
        self.lock().extract_stage(stage_key)
    }

    fn get_all(&self) -> HashMap<String, ApisixConfiguration> {
        self.lock().clone().group_by_stage()
    }

    async fn alter(
        &self,
        changed: HashMap<String, ApisixConfiguration>,
        on_failure: RetryCallback,
    ) -> StoreResult<()> {
        if changed.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let now = unix_now();
        let mut next = self.lock().clone();
        for (stage_key, desired) in &changed {
            apply_stage(&mut next, stage_key, desired.clone(), now);
        }

        let started = Instant::now();
        let result = self.write_document(&next).await;
        for kind in ResourceKind::WRITE_ORDER {
            metrics::record_store_operation(kind, "put", result.is_ok(), started);
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    path = %self.path.display(),
                    stages = changed.len(),
                    resources = next.statistic().total(),
                    "Standalone document written"
                );
                *self.lock() = next;
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to write standalone document");
                let mut stages: Vec<String> = changed.keys().cloned().collect();
                stages.sort_unstable();
                for (stage_key, desired) in changed {
                    metrics::record_stage_retry(&stage_key);
                    let on_failure = on_failure.clone();
                    tokio::spawn(async move { on_failure(stage_key, desired) });
                }
                Err(StoreError::StagesFailed { stages })
            }
        }
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::apisix::{GATEWAY_LABEL, STAGE_LABEL};

    fn route(id: &str, gateway: &str, stage: &str, uri: &str) -> Route {
        let mut route = Route {
            id: id.into(),
            uris: vec![uri.into()],
            ..Default::default()
        };
        route.labels.insert(GATEWAY_LABEL.into(), gateway.into());
        route.labels.insert(STAGE_LABEL.into(), stage.into());
        route
    }

    fn stage(resources: Vec<Route>) -> ApisixConfiguration {
        let mut config = ApisixConfiguration::new();
        resources.into_iter().for_each(|r| config.insert(r));
        config
    }

    fn noop_retry() -> RetryCallback {
        Arc::new(|_, _| {})
    }

    #[tokio::test]
    async fn test_alter_writes_merged_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apisix.yaml");
        let store = FileConfigStore::open(&path).await.unwrap();

        let changed = HashMap::from([
            ("gw/a".to_string(), stage(vec![route("gw.a.r1", "gw", "a", "/a")])),
            ("gw/b".to_string(), stage(vec![route("gw.b.r1", "gw", "b", "/b")])),
        ]);
        store.alter(changed, noop_retry()).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_end().ends_with("#END"));
        assert!(content.contains("gw.a.r1"));
        assert!(content.contains("gw.b.r1"));
        assert_eq!(store.get_all().len(), 2);
        assert_eq!(store.get("gw/a").routes.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_configuration_removes_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apisix.yaml");
        let store = FileConfigStore::open(&path).await.unwrap();

        let changed = HashMap::from([
            ("gw/a".to_string(), stage(vec![route("gw.a.r1", "gw", "a", "/a")])),
            ("gw/b".to_string(), stage(vec![route("gw.b.r1", "gw", "b", "/b")])),
        ]);
        store.alter(changed, noop_retry()).await.unwrap();

        let removal = HashMap::from([("gw/a".to_string(), ApisixConfiguration::new())]);
        store.alter(removal, noop_retry()).await.unwrap();

        let stages = store.get_all();
        assert!(!stages.contains_key("gw/a"));
        assert!(stages.contains_key("gw/b"));
        assert!(!std::fs::read_to_string(&path).unwrap().contains("gw.a.r1"));
    }

    #[tokio::test]
    async fn test_reopen_regroups_by_stage_and_keeps_create_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apisix.yaml");
        {
            let store = FileConfigStore::open(&path).await.unwrap();
            let changed = HashMap::from([(
                "gw/a".to_string(),
                stage(vec![route("gw.a.r1", "gw", "a", "/a")]),
            )]);
            store.alter(changed, noop_retry()).await.unwrap();
        }

        let store = FileConfigStore::open(&path).await.unwrap();
        let original = store.get("gw/a").routes["gw.a.r1"].create_time;
        assert!(original.is_some());

        let mut updated = route("gw.a.r1", "gw", "a", "/a-v2");
        updated.create_time = None;
        let changed = HashMap::from([("gw/a".to_string(), stage(vec![updated]))]);
        store.alter(changed, noop_retry()).await.unwrap();

        let stored = &store.get("gw/a").routes["gw.a.r1"];
        assert_eq!(stored.uris, vec!["/a-v2".to_string()]);
        assert_eq!(stored.create_time, original);
    }

    #[tokio::test]
    async fn test_plugin_metadata_only_deleted_by_its_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::open(dir.path().join("apisix.yaml")).await.unwrap();

        let mut with_metadata = stage(vec![route("gw.a.r1", "gw", "a", "/a")]);
        with_metadata.insert(PluginMetadata {
            id: "file-logger".into(),
            value: json!({"log_format": {"host": "$host"}})
                .as_object()
                .cloned()
                .unwrap(),
        });
        store
            .alter(HashMap::from([("gw/a".to_string(), with_metadata)]), noop_retry())
            .await
            .unwrap();
        assert_eq!(store.get(PLUGIN_METADATA_STAGE_KEY).plugin_metadata.len(), 1);

        store
            .alter(
                HashMap::from([("gw/a".to_string(), ApisixConfiguration::new())]),
                noop_retry(),
            )
            .await
            .unwrap();
        assert_eq!(store.get(PLUGIN_METADATA_STAGE_KEY).plugin_metadata.len(), 1);

        store
            .alter(
                HashMap::from([(PLUGIN_METADATA_STAGE_KEY.to_string(), ApisixConfiguration::new())]),
                noop_retry(),
            )
            .await
            .unwrap();
        assert!(store.get_all().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_hands_stages_to_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("apisix.yaml");
        let store = FileConfigStore::open(&path).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let retry: RetryCallback = Arc::new(move |stage_key, _| {
            let _ = tx.send(stage_key);
        });
        let changed = HashMap::from([(
            "gw/a".to_string(),
            stage(vec![route("gw.a.r1", "gw", "a", "/a")]),
        )]);

        let err = store.alter(changed, retry).await.unwrap_err();
        assert!(matches!(err, StoreError::StagesFailed { ref stages } if stages == &["gw/a"]));
        assert_eq!(rx.recv().await.unwrap(), "gw/a");
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn test_parse_empty_document() {
        assert!(parse_document("#END\n").unwrap().is_empty());
        assert!(parse_document("").unwrap().is_empty());
    }
}
