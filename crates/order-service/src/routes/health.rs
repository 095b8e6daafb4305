//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use timeout_wheel::TimeoutWheel;

/// What the ops endpoints can see of the running control plane.
#[derive(Clone)]
pub struct OpsState {
    pub shard_count: u16,
    pub wheel: Arc<TimeoutWheel>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub shards: u16,
    pub pending_timeouts: usize,
    pub wheel_running: bool,
}

/// GET /health: `ok` while the timeout wheel ticks, `503 degraded` otherwise.
///
/// A stopped wheel means payment deadlines are not enforced.
pub async fn check(State(state): State<OpsState>) -> (StatusCode, Json<HealthResponse>) {
    let wheel_running = state.wheel.is_running();
    let (status, label) = if wheel_running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label,
            shards: state.shard_count,
            pending_timeouts: state.wheel.pending(),
            wheel_running,
        }),
    )
}
