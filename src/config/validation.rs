//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts and intervals > 0)
//! - Validate addresses and paths the runtime will bind or write
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: SyncConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{StoreBackend, SyncConfig};

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("store.prefix must be a non-empty path starting with '/', got {0:?}")]
    InvalidPrefix(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("store.endpoints must list at least one endpoint for the etcd backend")]
    MissingEndpoints,

    #[error("store.file_path must be set for the file backend")]
    MissingFilePath,

    #[error("virtual_stage.{0} must not be empty")]
    EmptyVirtualName(&'static str),

    #[error("virtual_stage.health_check_path must start with '/', got {0:?}")]
    InvalidHealthCheckPath(String),

    #[error("{field} is not a valid socket address: {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("admin.api_key must be set when the admin API is enabled")]
    MissingApiKey,
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &SyncConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let store = &config.store;
    if !store.prefix.starts_with('/') || store.prefix.trim_end_matches('/').is_empty() {
        errors.push(ValidationError::InvalidPrefix(store.prefix.clone()));
    }
    let durations = [
        ("store.connect_timeout_secs", store.connect_timeout_secs),
        ("store.list_timeout_secs", store.list_timeout_secs),
        ("store.watch_retry_interval_secs", store.watch_retry_interval_secs),
        ("store.operation_timeout_secs", store.operation_timeout_secs),
        ("synchronizer.flush_interval_secs", config.synchronizer.flush_interval_secs),
    ];
    for (field, value) in durations {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration(field));
        }
    }
    if store.backend == StoreBackend::Etcd
        && store.endpoints.iter().all(|endpoint| endpoint.trim().is_empty())
    {
        errors.push(ValidationError::MissingEndpoints);
    }
    if store.backend == StoreBackend::File && store.file_path.as_os_str().is_empty() {
        errors.push(ValidationError::MissingFilePath);
    }

    let virtual_stage = &config.virtual_stage;
    if virtual_stage.gateway_name.is_empty() {
        errors.push(ValidationError::EmptyVirtualName("gateway_name"));
    }
    if virtual_stage.stage_name.is_empty() {
        errors.push(ValidationError::EmptyVirtualName("stage_name"));
    }
    if !virtual_stage.health_check_path.starts_with('/') {
        errors.push(ValidationError::InvalidHealthCheckPath(
            virtual_stage.health_check_path.clone(),
        ));
    }

    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::MissingApiKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
