//! Proxy resource definitions.
//!
//! # Responsibilities
//! - Define the four resource kinds written to the proxy's store
//! - Expose the shared capability contract (id, stage, timestamps)
//! - Map store key prefixes to resource kinds
//!
//! # Design Decisions
//! - One `ResourceKind` tag per type instead of runtime type inspection
//! - Timestamps are seconds since epoch, `None` until the store adapter stamps them
//! - Plugin metadata is process-wide and lives under a fixed stage key

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::apisix::ApisixConfiguration;

/// Label carrying the owning gateway name.
pub const GATEWAY_LABEL: &str = "gateway.apisix-sync/gateway";

/// Label carrying the owning stage name.
pub const STAGE_LABEL: &str = "gateway.apisix-sync/stage";

/// Stage key every plugin metadata entry belongs to.
pub const PLUGIN_METADATA_STAGE_KEY: &str = "default";

/// Resource label map.
pub type Labels = BTreeMap<String, String>;

/// Plugin name → plugin configuration tree.
pub type Plugins = Map<String, Value>;

/// Build the `<gateway>/<stage>` key identifying one stage's configuration slice.
pub fn build_stage_key(gateway: &str, stage: &str) -> String {
    format!("{}/{}", gateway, stage)
}

/// Resource type tag, also the store path segment of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Route,
    Service,
    Ssl,
    PluginMetadata,
}

impl ResourceKind {
    /// All kinds, in dependency (write) order.
    pub const WRITE_ORDER: [ResourceKind; 4] = [
        ResourceKind::Ssl,
        ResourceKind::PluginMetadata,
        ResourceKind::Service,
        ResourceKind::Route,
    ];

    /// Store path segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Route => "routes",
            ResourceKind::Service => "services",
            ResourceKind::Ssl => "ssls",
            ResourceKind::PluginMetadata => "plugin_metadata",
        }
    }

    /// Resolve the kind stored under `prefix` from its last path segment.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        let segment = prefix.trim_end_matches('/').rsplit('/').next()?;
        Self::WRITE_ORDER
            .into_iter()
            .find(|kind| kind.as_str() == segment)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability contract shared by all proxy resources.
pub trait ApisixResource:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Type tag of the resource.
    const KIND: ResourceKind;

    /// Top-level fields left out of structural comparison.
    const VOLATILE_FIELDS: &'static [&'static str];

    fn id(&self) -> &str;

    fn labels(&self) -> Option<&Labels>;

    /// The map holding this kind inside a configuration.
    fn select(config: &ApisixConfiguration) -> &HashMap<String, Self>;

    fn select_mut(config: &mut ApisixConfiguration) -> &mut HashMap<String, Self>;

    /// Gateway and stage names from the resource labels (empty when unlabelled).
    fn gateway_and_stage(&self) -> (&str, &str) {
        match self.labels() {
            Some(labels) => (
                labels.get(GATEWAY_LABEL).map(String::as_str).unwrap_or_default(),
                labels.get(STAGE_LABEL).map(String::as_str).unwrap_or_default(),
            ),
            None => ("", ""),
        }
    }

    fn stage_key(&self) -> String {
        let (gateway, stage) = self.gateway_and_stage();
        build_stage_key(gateway, stage)
    }

    fn create_time(&self) -> Option<i64> {
        None
    }

    fn update_time(&self) -> Option<i64> {
        None
    }

    fn set_create_time(&mut self, _secs: i64) {}

    fn set_update_time(&mut self, _secs: i64) {}
}

macro_rules! timestamped {
    () => {
        fn create_time(&self) -> Option<i64> {
            self.create_time
        }

        fn update_time(&self) -> Option<i64> {
            self.update_time
        }

        fn set_create_time(&mut self, secs: i64) {
            self.create_time = Some(secs);
        }

        fn set_update_time(&mut self, secs: i64) {
            self.update_time = Some(secs);
        }
    };
}

const TIMESTAMPED_VOLATILE_FIELDS: &[&str] = &["desc", "labels", "create_time", "update_time"];

/// A proxy route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// Match priority (higher = checked first).
    #[serde(default)]
    pub priority: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Value>,

    #[serde(default, skip_serializing_if = "Plugins::is_empty")]
    pub plugins: Plugins,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_websocket: Option<bool>,

    /// 1 = enabled, 0 = disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
}

impl ApisixResource for Route {
    const KIND: ResourceKind = ResourceKind::Route;
    const VOLATILE_FIELDS: &'static [&'static str] = TIMESTAMPED_VOLATILE_FIELDS;

    fn id(&self) -> &str {
        &self.id
    }

    fn labels(&self) -> Option<&Labels> {
        Some(&self.labels)
    }

    fn select(config: &ApisixConfiguration) -> &HashMap<String, Self> {
        &config.routes
    }

    fn select_mut(config: &mut ApisixConfiguration) -> &mut HashMap<String, Self> {
        &mut config.routes
    }

    timestamped!();
}

/// A proxy service (shared upstream + plugins referenced by routes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "Plugins::is_empty")]
    pub plugins: Plugins,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_websocket: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
}

impl ApisixResource for Service {
    const KIND: ResourceKind = ResourceKind::Service;
    const VOLATILE_FIELDS: &'static [&'static str] = TIMESTAMPED_VOLATILE_FIELDS;

    fn id(&self) -> &str {
        &self.id
    }

    fn labels(&self) -> Option<&Labels> {
        Some(&self.labels)
    }

    fn select(config: &ApisixConfiguration) -> &HashMap<String, Self> {
        &config.services
    }

    fn select_mut(config: &mut ApisixConfiguration) -> &mut HashMap<String, Self> {
        &mut config.services
    }

    timestamped!();
}

/// A TLS certificate served by the proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ssl {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snis: Vec<String>,

    /// Client certificate verification settings (mTLS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
}

impl ApisixResource for Ssl {
    const KIND: ResourceKind = ResourceKind::Ssl;
    const VOLATILE_FIELDS: &'static [&'static str] = TIMESTAMPED_VOLATILE_FIELDS;

    fn id(&self) -> &str {
        &self.id
    }

    fn labels(&self) -> Option<&Labels> {
        Some(&self.labels)
    }

    fn select(config: &ApisixConfiguration) -> &HashMap<String, Self> {
        &config.ssls
    }

    fn select_mut(config: &mut ApisixConfiguration) -> &mut HashMap<String, Self> {
        &mut config.ssls
    }

    timestamped!();
}

/// Process-wide configuration of one plugin, keyed by plugin name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,

    #[serde(flatten)]
    pub value: Map<String, Value>,
}

impl ApisixResource for PluginMetadata {
    const KIND: ResourceKind = ResourceKind::PluginMetadata;
    const VOLATILE_FIELDS: &'static [&'static str] = &[];

    fn id(&self) -> &str {
        &self.id
    }

    fn labels(&self) -> Option<&Labels> {
        None
    }

    fn select(config: &ApisixConfiguration) -> &HashMap<String, Self> {
        &config.plugin_metadata
    }

    fn select_mut(config: &mut ApisixConfiguration) -> &mut HashMap<String, Self> {
        &mut config.plugin_metadata
    }

    fn stage_key(&self) -> String {
        PLUGIN_METADATA_STAGE_KEY.to_string()
    }
}
