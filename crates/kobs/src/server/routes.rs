use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::{
    manager::{JobManager, ManagerState},
    metrics::gather_metrics,
};

pub async fn health(State(manager): State<Arc<JobManager>>) -> impl IntoResponse {
    let state = manager.state();
    let (code, status) = match state {
        ManagerState::Running => (StatusCode::OK, "healthy"),
        ManagerState::Idle | ManagerState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    (code, Json(json!({ "status": status, "reconciler": state })))
}

pub async fn metrics() -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}
