//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SyncConfig (validated, immutable)
//!     → store, synchronizer, virtual stage, admin settings
//!
//! Desired state document (JSON):
//!     watcher.rs detects change
//!     → load_desired_state parses it
//!     → runtime applies each stage via sync, then removes absent stages
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the desired state reloads
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, LogFormat, ObservabilityConfig, StoreBackend, StoreConfig, SyncConfig,
    VirtualStageConfig,
};
pub use watcher::{load_desired_state, DesiredState, DesiredStateWatcher};
