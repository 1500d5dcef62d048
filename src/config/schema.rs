//! Configuration schema definitions.
//!
//! All sections derive Serde traits and default every field, so a minimal
//! TOML file (or none at all) yields a working configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{CacheSettings, KvStoreSettings};

/// Root configuration of the synchronizer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Where the proxy configuration is written.
    pub store: StoreConfig,

    pub synchronizer: SynchronizerConfig,

    /// Built-in stage settings.
    pub virtual_stage: VirtualStageConfig,

    /// Desired-state input.
    pub source: SourceConfig,

    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,
}

/// Store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// etcd cluster the proxy reads its configuration from.
    #[default]
    Etcd,
    /// Revisioned in-process key-value store, for local runs and tests.
    Memory,
    /// Standalone YAML document.
    File,
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// etcd endpoints of the etcd backend.
    pub endpoints: Vec<String>,

    pub connect_timeout_secs: u64,

    /// Key prefix of the proxy configuration.
    pub prefix: String,

    /// Output document of the file backend.
    pub file_path: PathBuf,

    pub list_timeout_secs: u64,

    /// Pause before reopening a failed watch.
    pub watch_retry_interval_secs: u64,

    /// Deadline of each put and delete.
    pub operation_timeout_secs: u64,

    /// Pause between writing services and the routes that use them.
    pub route_put_interval_ms: u64,

    /// Treat a stored `{}` as "no resource yet".
    pub empty_object_is_placeholder: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            connect_timeout_secs: 5,
            prefix: "/apisix".to_string(),
            file_path: PathBuf::from("apisix.yaml"),
            list_timeout_secs: 60,
            watch_retry_interval_secs: 5,
            operation_timeout_secs: 10,
            route_put_interval_ms: 500,
            empty_object_is_placeholder: true,
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Settings of the key-value backed store.
    pub fn kv_settings(&self) -> KvStoreSettings {
        KvStoreSettings {
            prefix: self.prefix.clone(),
            cache: CacheSettings {
                list_timeout: Duration::from_secs(self.list_timeout_secs),
                retry_interval: Duration::from_secs(self.watch_retry_interval_secs),
                empty_object_is_placeholder: self.empty_object_is_placeholder,
            },
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            route_put_interval: Duration::from_millis(self.route_put_interval_ms),
        }
    }
}

/// Flush scheduling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynchronizerConfig {
    pub flush_interval_secs: u64,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 10,
        }
    }
}

impl SynchronizerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Built-in stage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VirtualStageConfig {
    /// Reserved gateway name.
    pub gateway_name: String,

    /// Reserved stage name.
    pub stage_name: String,

    /// Optional YAML file of extra routes, services and SSLs.
    pub extra_resources_path: Option<PathBuf>,

    pub health_check_path: String,

    /// Requests per second admitted to the health-check route.
    pub health_check_rate: u32,

    /// Priority of the catch-all 404 route.
    pub not_found_priority: i64,
}

impl Default for VirtualStageConfig {
    fn default() -> Self {
        Self {
            gateway_name: "-".to_string(),
            stage_name: "-".to_string(),
            extra_resources_path: None,
            health_check_path: "/healthz".to_string(),
            health_check_rate: 10,
            not_found_priority: -100,
        }
    }
}

/// Desired-state input.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SourceConfig {
    /// JSON document mapping stage keys to configurations, watched for changes.
    pub desired_state_path: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    /// Bearer token required by every admin endpoint.
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
