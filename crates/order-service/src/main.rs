//! Control plane entry point.

use std::sync::Arc;

use order_service::{Backends, Config, ControlPlane, LogFormat, ServiceError};
use order_store::{InMemoryOrderStore, OrderStore, OutboxStore, PgOrderStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<S>(config: &Config, store: Arc<S>) -> Result<(), ServiceError>
where
    S: OrderStore + OutboxStore + 'static,
{
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| ServiceError::Metrics(err.to_string()))?;

    let plane = ControlPlane::start(config, store, Backends::in_memory()).await?;
    let app = order_service::create_app(plane.ops_state(), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting ops server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    plane.shutdown().await?;
    served?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    match &config.database_urls {
        Some(urls) => {
            let store = PgOrderStore::connect(urls, config.db_max_connections).await?;
            store.run_migrations().await?;
            tracing::info!(shards = urls.len(), "using PostgreSQL order store");
            serve(&config, Arc::new(store)).await
        }
        None => {
            tracing::warn!(
                shards = config.shard_count,
                "DATABASE_URLS not set, orders are kept in memory"
            );
            let store = InMemoryOrderStore::new(config.shard_count)?;
            serve(&config, Arc::new(store)).await
        }
    }
}
