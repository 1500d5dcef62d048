//! Admin API.
//!
//! # Endpoints
//! - `GET /admin/status`: version, store backend, stage and pending counts
//! - `GET /admin/stages`: stored stage keys with resource counts
//! - `GET /admin/stages/{gateway}/{stage}`: one stage's stored configuration
//! - `POST /admin/flush`: trigger an asynchronous flush
//!
//! Every endpoint requires the configured bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::synchronizer::ApisixConfigSynchronizer;

/// Shared state of the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub synchronizer: Arc<ApisixConfigSynchronizer>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(synchronizer: Arc<ApisixConfigSynchronizer>, api_key: &str) -> Self {
        Self {
            synchronizer,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/stages", get(get_stages))
        .route("/admin/stages/{gateway}/{stage}", get(get_stage))
        .route("/admin/flush", post(post_flush))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
