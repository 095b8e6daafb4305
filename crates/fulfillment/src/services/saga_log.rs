//! Saga log contract.
//!
//! The log takes ownership of a submitted saga: it runs the forward steps,
//! retries them and compensates on failure. The coordinator only submits and
//! later receives the outcome as a callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{FulfillmentError, Result};
use crate::saga::SagaDefinition;

#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Hands the full step list over. Called once per order.
    async fn submit(&self, saga: SagaDefinition) -> Result<()>;
}

/// Saga log that queues sagas for an in-process [`SagaWorker`](crate::saga::SagaWorker).
#[derive(Debug, Clone)]
pub struct InProcessSagaLog {
    sender: mpsc::Sender<SagaDefinition>,
}

impl InProcessSagaLog {
    /// Creates the log and the receiving end the worker drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SagaDefinition>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SagaLog for InProcessSagaLog {
    async fn submit(&self, saga: SagaDefinition) -> Result<()> {
        self.sender
            .send(saga)
            .await
            .map_err(|_| FulfillmentError::service("saga log", "saga worker is not running"))
    }
}

/// Saga log that only records submissions.
#[derive(Debug, Clone, Default)]
pub struct RecordingSagaLog {
    submitted: Arc<Mutex<Vec<SagaDefinition>>>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingSagaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` submissions fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<SagaDefinition> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl SagaLog for RecordingSagaLog {
    async fn submit(&self, saga: SagaDefinition) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FulfillmentError::service(
                "saga log",
                "connection reset by peer",
            ));
        }
        self.submitted.lock().push(saga);
        Ok(())
    }
}
