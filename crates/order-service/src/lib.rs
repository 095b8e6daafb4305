//! Order fulfillment control plane service.
//!
//! Wires the sharded order store, the saga coordinator, the payment timeout
//! wheel and the outbox relay into one process, and exposes `/health` and
//! `/metrics` for operators.

pub mod bus;
pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use routes::metrics::MetricsState;

pub use bus::LoggingMessageBus;
pub use config::{Config, ConfigError, LogFormat};
pub use error::{Result, ServiceError};
pub use routes::health::OpsState;
pub use runtime::{Backends, ControlPlane};

/// Creates the ops router.
pub fn create_app(state: OpsState, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(MetricsState {
            handle: metrics_handle,
            wheel: state.wheel.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}
