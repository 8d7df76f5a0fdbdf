use axum::debug_handler;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::gateway_util::{AppState, AppStateData};

/// A handler for a simple liveness check; reads the store size but never
/// touches per-user state
#[debug_handler(state = AppStateData)]
pub async fn status_handler(
    State(AppStateData {
        config,
        quota_store,
        start_time,
        ..
    }): AppState,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        service: config.gateway.service_name.clone(),
        active_users: quota_store.active_users(),
        uptime_seconds: start_time.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub service: String,
    #[serde(rename = "activeUsers")]
    pub active_users: usize,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
}
