//! Background consumer of the in-process saga log.

use std::sync::Arc;
use std::time::Duration;

use order_store::OrderStore;
use tokio::sync::{mpsc, watch};

use crate::error::ErrorKind;

use super::coordinator::SagaCoordinator;
use super::definition::SagaDefinition;
use super::executor::{SagaExecutor, SagaOutcome};

const DEFAULT_APPLY_ATTEMPTS: u32 = 3;
const DEFAULT_APPLY_BACKOFF: Duration = Duration::from_millis(50);

/// Executes submitted sagas one at a time and reports each outcome back to
/// the coordinator.
///
/// An outcome the coordinator cannot record is retried with doubling
/// backoff. If it still fails, a completed saga is compensated so the
/// stock it deducted goes back; the order itself is left to its payment
/// timeout.
pub struct SagaWorker<S: ?Sized> {
    receiver: mpsc::Receiver<SagaDefinition>,
    executor: SagaExecutor,
    coordinator: Arc<SagaCoordinator<S>>,
    attempts: u32,
    backoff: Duration,
}

impl<S> SagaWorker<S>
where
    S: OrderStore + 'static,
{
    pub fn new(
        receiver: mpsc::Receiver<SagaDefinition>,
        executor: SagaExecutor,
        coordinator: Arc<SagaCoordinator<S>>,
    ) -> Self {
        Self {
            receiver,
            executor,
            coordinator,
            attempts: DEFAULT_APPLY_ATTEMPTS,
            backoff: DEFAULT_APPLY_BACKOFF,
        }
    }

    /// Sets how often an outcome is applied before it is given up, and the
    /// wait before the first retry.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` flips to `true` or every sender is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("saga worker started");
        loop {
            tokio::select! {
                saga = self.receiver.recv() => match saga {
                    Some(saga) => self.process(&saga).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("saga worker stopped");
    }

    /// Executes one saga and applies its outcome.
    pub async fn process(&self, saga: &SagaDefinition) {
        let started = std::time::Instant::now();
        let outcome = self.executor.execute(saga).await;
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());

        if self.apply(saga, &outcome).await {
            return;
        }
        metrics::counter!("saga_outcome_dropped_total").increment(1);
        if outcome == SagaOutcome::Completed && !self.was_confirmed(saga).await {
            let failures = self.executor.compensate_all(saga).await;
            tracing::error!(
                order_no = %saga.order_no,
                compensation_failures = ?failures,
                "saga outcome dropped, allocation compensated"
            );
        }
    }

    /// Returns `false` once every attempt failed.
    async fn apply(&self, saga: &SagaDefinition, outcome: &SagaOutcome) -> bool {
        let mut backoff = self.backoff;
        for attempt in 1..=self.attempts {
            match self
                .coordinator
                .apply_saga_outcome(&saga.order_no, outcome)
                .await
            {
                Ok(_) => return true,
                Err(err) => {
                    let retry = attempt < self.attempts && err.kind() == ErrorKind::Infrastructure;
                    tracing::error!(
                        order_no = %saga.order_no,
                        attempt,
                        error = %err,
                        retry,
                        "saga callback failed"
                    );
                    if !retry {
                        return false;
                    }
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
        false
    }

    /// A commit can succeed even when its caller saw an error.
    async fn was_confirmed(&self, saga: &SagaDefinition) -> bool {
        match self.coordinator.orders().get(&saga.order_no).await {
            Ok(order) => order.timestamps().confirmed_at.is_some(),
            Err(_) => false,
        }
    }
}
