use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::apisix::{build_stage_key, ApisixConfiguration, ConfigurationStatistic};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub backend: &'static str,
    pub stages: usize,
    pub pending_stages: usize,
}

#[derive(Serialize)]
pub struct StageSummary {
    pub stage_key: String,
    pub resources: ConfigurationStatistic,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let store = state.synchronizer.store();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        backend: store.backend(),
        stages: store.get_all().len(),
        pending_stages: state.synchronizer.pending_stages(),
    })
}

pub async fn get_stages(State(state): State<AdminState>) -> Json<Vec<StageSummary>> {
    let mut stages: Vec<StageSummary> = state
        .synchronizer
        .store()
        .get_all()
        .into_iter()
        .map(|(stage_key, config)| StageSummary {
            stage_key,
            resources: config.statistic(),
        })
        .collect();
    stages.sort_unstable_by(|a, b| a.stage_key.cmp(&b.stage_key));
    Json(stages)
}

pub async fn get_stage(
    State(state): State<AdminState>,
    Path((gateway, stage)): Path<(String, String)>,
) -> Result<Json<ApisixConfiguration>, StatusCode> {
    let config = state
        .synchronizer
        .store()
        .get(&build_stage_key(&gateway, &stage));
    if config.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(config))
}

/// Start a flush without waiting for it.
pub async fn post_flush(State(state): State<AdminState>) -> StatusCode {
    tracing::info!("Flush requested through admin API");
    state.synchronizer.flush();
    StatusCode::ACCEPTED
}
