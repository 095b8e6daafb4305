//! Prometheus scrape endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use timeout_wheel::TimeoutWheel;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub wheel: Arc<TimeoutWheel>,
}

/// GET /metrics
///
/// Wheel occupancy is sampled at scrape time rather than on every schedule.
pub async fn render(State(state): State<MetricsState>) -> impl IntoResponse {
    metrics::gauge!("timeout_wheel_pending").set(state.wheel.pending() as f64);
    let running = if state.wheel.is_running() { 1.0 } else { 0.0 };
    metrics::gauge!("timeout_wheel_running").set(running);
    ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], state.handle.render())
}
