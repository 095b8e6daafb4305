//! Wiring of the control plane's long-running parts.

use std::sync::Arc;

use common::IdGenerator;
use fulfillment::services::{
    CouponService, InMemoryCouponService, InMemoryPaymentService, InMemoryStockService,
    InProcessSagaLog, PaymentService, RiskService, StaticRiskService, StaticWarehouseAllocator,
    StockService, WarehouseAllocator,
};
use fulfillment::{
    Collaborators, OrderService, PaymentTimeouts, SagaCoordinator, SagaExecutor, SagaWorker,
};
use order_store::{MessageBus, OrderStore, OutboxRelay, OutboxStore, RelayConfig};
use timeout_wheel::{TimeoutWheel, WheelConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::LoggingMessageBus;
use crate::config::Config;
use crate::error::Result;
use crate::routes::health::OpsState;

const SAGA_QUEUE_CAPACITY: usize = 1024;

/// Collaborator endpoints the control plane talks to.
///
/// The order store is not one of them; it is handed to
/// [`ControlPlane::start`] on its own.
#[derive(Clone)]
pub struct Backends {
    pub stock: Arc<dyn StockService>,
    pub coupons: Arc<dyn CouponService>,
    pub payments: Arc<dyn PaymentService>,
    pub risk: Arc<dyn RiskService>,
    pub warehouses: Arc<dyn WarehouseAllocator>,
    pub bus: Arc<dyn MessageBus>,
}

impl Backends {
    /// In-process doubles for every collaborator, with outbox messages logged.
    pub fn in_memory() -> Self {
        Self {
            stock: Arc::new(InMemoryStockService::new()),
            coupons: Arc::new(InMemoryCouponService::new()),
            payments: Arc::new(InMemoryPaymentService::new()),
            risk: Arc::new(StaticRiskService::allow_all()),
            warehouses: Arc::new(StaticWarehouseAllocator::default()),
            bus: Arc::new(LoggingMessageBus),
        }
    }
}

/// A running control plane: coordinator, timeout wheel, saga worker and
/// outbox relay sharing one shutdown signal.
pub struct ControlPlane<S> {
    coordinator: Arc<SagaCoordinator<S>>,
    wheel: Arc<TimeoutWheel>,
    shard_count: u16,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> ControlPlane<S>
where
    S: OrderStore + OutboxStore + 'static,
{
    /// Builds every component, restores payment deadlines and spawns the
    /// background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: &Config, store: Arc<S>, backends: Backends) -> Result<Self> {
        let wheel = Arc::new(TimeoutWheel::new(WheelConfig {
            tick: config.wheel_tick,
            slots: config.wheel_slots,
        })?);
        let ids = Arc::new(IdGenerator::new(config.worker_id)?);
        let (saga_log, saga_queue) = InProcessSagaLog::channel(SAGA_QUEUE_CAPACITY);

        let timeouts = PaymentTimeouts::new(
            Arc::clone(&wheel),
            OrderService::new(Arc::clone(&store)),
            config.payment_timeout,
        );
        let coordinator = Arc::new(SagaCoordinator::new(
            Arc::clone(&store),
            ids,
            timeouts.clone(),
            Collaborators {
                stock: Arc::clone(&backends.stock),
                coupons: Arc::clone(&backends.coupons),
                payments: backends.payments,
                risk: backends.risk,
                saga_log: Arc::new(saga_log),
                warehouses: backends.warehouses,
            },
        ));

        timeouts.rehydrate(config.rehydrate_grace).await?;
        wheel.start()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        let worker = SagaWorker::new(
            saga_queue,
            SagaExecutor::new(backends.stock, backends.coupons),
            Arc::clone(&coordinator),
        );
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));

        let relay = OutboxRelay::new(
            Arc::clone(&store),
            backends.bus,
            RelayConfig {
                poll_interval: config.outbox_poll,
                batch_size: config.outbox_batch_size,
            },
        );
        tasks.push(tokio::spawn(relay.run(shutdown_rx.clone())));

        // Orders younger than the grace window were skipped above; their
        // previous owner may still have them. Pick them up once it has lapsed.
        if !config.rehydrate_grace.is_zero() {
            tasks.push(tokio::spawn(late_rehydrate(
                timeouts,
                config.rehydrate_grace,
                shutdown_rx,
            )));
        }

        tracing::info!(
            shards = store.shard_count(),
            payment_timeout_secs = config.payment_timeout.as_secs(),
            "control plane started"
        );

        Ok(Self {
            coordinator,
            shard_count: store.shard_count(),
            wheel,
            shutdown,
            tasks,
        })
    }

    pub fn coordinator(&self) -> &Arc<SagaCoordinator<S>> {
        &self.coordinator
    }

    pub fn wheel(&self) -> &Arc<TimeoutWheel> {
        &self.wheel
    }

    pub fn ops_state(&self) -> OpsState {
        OpsState {
            shard_count: self.shard_count,
            wheel: Arc::clone(&self.wheel),
        }
    }

    /// Signals every task, waits for them and stops the wheel.
    ///
    /// Scheduled timeouts are dropped with the process; the next start
    /// rebuilds them from the store.
    pub async fn shutdown(self) -> Result<()> {
        // Receivers only disappear when their task already ended.
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "background task ended abnormally");
            }
        }
        self.wheel.stop().await?;
        tracing::info!(
            pending_timeouts = self.wheel.pending(),
            "control plane stopped"
        );
        Ok(())
    }
}

async fn late_rehydrate<S>(
    timeouts: PaymentTimeouts<S>,
    grace: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: OrderStore + 'static,
{
    tokio::select! {
        _ = tokio::time::sleep(grace) => {
            if let Err(err) = timeouts.rehydrate(grace).await {
                tracing::error!(error = %err, "late payment timeout rehydration failed");
            }
        }
        _ = shutdown.changed() => {}
    }
}
