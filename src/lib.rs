//! APISIX configuration synchronizer library.
//!
//! Converges a proxy's configuration store to a supplied per-stage desired
//! state with minimal, dependency-ordered writes.
//!
//! # Architecture Overview
//!
//! ```text
//!   desired state (per stage)
//!          │
//!          ▼
//!   ┌──────────────┐  flush   ┌───────────────┐  put/delete  ┌──────────────┐
//!   │ synchronizer │─────────▶│  store (kv /  │─────────────▶│  KV store /  │
//!   │ double buffer│◀─────────│  file)        │              │  YAML file   │
//!   └──────────────┘  retry   └───────┬───────┘              └──────┬───────┘
//!                                     │ diff                        │ watch
//!                                     ▼                             ▼
//!                              ┌─────────────┐               ┌──────────────┐
//!                              │    diff     │◀──────────────│resource cache│
//!                              └─────────────┘  current state└──────────────┘
//! ```

// Core subsystems
pub mod apisix;
pub mod diff;
pub mod store;
pub mod synchronizer;

// Cross-cutting concerns
pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use apisix::ApisixConfiguration;
pub use config::schema::SyncConfig;
pub use lifecycle::Shutdown;
pub use store::ApisixConfigStore;
pub use synchronizer::ApisixConfigSynchronizer;
