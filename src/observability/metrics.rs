//! Metrics collection and exposition.
//!
//! # Metrics
//! - `apisix_sync_store_operations_total` (counter): store writes/deletes by type, action, result
//! - `apisix_sync_store_operation_duration_seconds` (histogram): store write/delete latency
//! - `apisix_sync_sync_events_total` (counter): desired-state updates by gateway, stage
//! - `apisix_sync_flush_total` (counter): flush cycles by result
//! - `apisix_sync_flush_duration_seconds` (histogram): flush latency
//! - `apisix_sync_comparisons_total` (counter): structural comparisons by gateway, stage, type
//! - `apisix_sync_differences_total` (counter): comparisons that found a difference
//! - `apisix_sync_resources_written_total` (counter): resources written by gateway, stage, type
//! - `apisix_sync_stage_retries_total` (counter): stages re-queued after a failed alter
//! - `apisix_sync_cache_resyncs_total` (counter): forced full listings by type
//!
//! # Design Decisions
//! - Labels for gateway, stage and resource type
//! - Histograms in seconds

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::apisix::ResourceKind;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "fail"
    }
}

/// Record one store write or delete.
pub fn record_store_operation(kind: ResourceKind, action: &'static str, ok: bool, started: Instant) {
    metrics::counter!(
        "apisix_sync_store_operations_total",
        "type" => kind.as_str(),
        "action" => action,
        "result" => result_label(ok),
    )
    .increment(1);
    metrics::histogram!(
        "apisix_sync_store_operation_duration_seconds",
        "type" => kind.as_str(),
        "action" => action,
    )
    .record(started.elapsed().as_secs_f64());
}

pub fn record_sync_event(gateway: &str, stage: &str) {
    metrics::counter!(
        "apisix_sync_sync_events_total",
        "gateway" => gateway.to_string(),
        "stage" => stage.to_string(),
    )
    .increment(1);
}

pub fn record_flush(ok: bool, started: Instant) {
    metrics::counter!("apisix_sync_flush_total", "result" => result_label(ok)).increment(1);
    metrics::histogram!("apisix_sync_flush_duration_seconds")
        .record(started.elapsed().as_secs_f64());
}

pub fn record_comparison(gateway: &str, stage: &str, kind: ResourceKind) {
    metrics::counter!(
        "apisix_sync_comparisons_total",
        "gateway" => gateway.to_string(),
        "stage" => stage.to_string(),
        "type" => kind.as_str(),
    )
    .increment(1);
}

pub fn record_difference(gateway: &str, stage: &str, kind: ResourceKind) {
    metrics::counter!(
        "apisix_sync_differences_total",
        "gateway" => gateway.to_string(),
        "stage" => stage.to_string(),
        "type" => kind.as_str(),
    )
    .increment(1);
}

pub fn record_resource_written(gateway: &str, stage: &str, kind: ResourceKind) {
    metrics::counter!(
        "apisix_sync_resources_written_total",
        "gateway" => gateway.to_string(),
        "stage" => stage.to_string(),
        "type" => kind.as_str(),
    )
    .increment(1);
}

pub fn record_stage_retry(stage_key: &str) {
    metrics::counter!("apisix_sync_stage_retries_total", "stage_key" => stage_key.to_string())
        .increment(1);
}

pub fn record_cache_resync(kind: ResourceKind) {
    metrics::counter!("apisix_sync_cache_resyncs_total", "type" => kind.as_str()).increment(1);
}
