//! Gateway proxy configuration model.
//!
//! # Data Flow
//! ```text
//! converter (external) builds resources per stage
//!     → ApisixConfiguration (routes, services, ssls, plugin_metadata)
//!     → synchronizer pending buffer
//!     → store adapter diff + apply
//! ```
//!
//! # Design Decisions
//! - Resources are plain value objects; only the store adapter writes timestamps
//! - Stage affiliation comes from the gateway/stage label pair
//! - Plugin configuration is a `serde_json::Value` tree built by one decoder

pub mod configuration;
pub mod resource;
pub mod value;

pub use configuration::{ApisixConfiguration, ConfigurationStatistic};
pub use resource::{
    build_stage_key, ApisixResource, Labels, PluginMetadata, Plugins, ResourceKind, Route, Service,
    Ssl, GATEWAY_LABEL, PLUGIN_METADATA_STAGE_KEY, STAGE_LABEL,
};
