//! Transactional outbox.
//!
//! Events are written into the same shard transaction as the order change
//! they describe. [`OutboxRelay`] later pushes pending rows to the
//! [`MessageBus`] in creation order and marks them delivered.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ShardId;
use domain::DomainEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{OrderTransaction, Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "Pending",
            DeliveryStatus::Delivered => "Delivered",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(DeliveryStatus::Pending),
            "Delivered" => Ok(DeliveryStatus::Delivered),
            other => Err(StoreError::Decode(format!("unknown delivery status {other:?}"))),
        }
    }
}

/// One row of the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    /// Consumers deduplicate on this key; it is the order number.
    pub dedup_key: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        topic: impl Into<String>,
        dedup_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            dedup_key: dedup_key.into(),
            payload,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            delivered_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}

/// Writes outbox rows through a caller-supplied transaction.
///
/// The publisher never opens a transaction of its own.
pub struct OutboxPublisher;

impl OutboxPublisher {
    #[tracing::instrument(skip(tx, payload), fields(shard = %tx.shard()))]
    pub async fn publish_in_transaction<T, P>(
        tx: &mut T,
        topic: &str,
        dedup_key: &str,
        payload: &P,
    ) -> Result<Uuid>
    where
        T: OrderTransaction + ?Sized,
        P: Serialize + ?Sized,
    {
        let message = OutboxMessage::new(topic, dedup_key, serde_json::to_value(payload)?);
        tx.insert_outbox(&message).await?;
        metrics::counter!("outbox_written_total", "topic" => topic.to_string()).increment(1);
        Ok(message.id)
    }

    /// Publishes a domain event under its own topic and dedup key.
    pub async fn publish_event<T, E>(tx: &mut T, event: &E) -> Result<Uuid>
    where
        T: OrderTransaction + ?Sized,
        E: DomainEvent,
    {
        let dedup_key = event.dedup_key();
        Self::publish_in_transaction(tx, event.topic(), &dedup_key, event).await
    }
}

/// Read side of the outbox used by the relay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    fn outbox_shards(&self) -> u16;

    /// Pending rows on `shard`, oldest first.
    async fn fetch_pending(&self, shard: ShardId, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Takes rows out of the pending set. A backend may keep them as an
    /// audit trail or drop them.
    async fn mark_delivered(&self, shard: ShardId, ids: &[Uuid]) -> Result<()>;

    /// Counts a failed delivery attempt. The row stays pending.
    async fn record_failure(&self, shard: ShardId, id: Uuid) -> Result<()>;
}

#[derive(Debug, Error)]
#[error("Message bus error: {0}")]
pub struct BusError(pub String);

/// Destination of outbox rows.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), BusError>;
}

/// Bus that keeps delivered messages in memory.
#[derive(Default)]
pub struct InMemoryMessageBus {
    delivered: Mutex<Vec<OutboxMessage>>,
    failures_left: AtomicUsize,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<OutboxMessage> {
        self.delivered.lock().clone()
    }

    pub fn delivered_topics(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: &OutboxMessage) -> std::result::Result<(), BusError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError(format!("injected failure for {}", message.id)));
        }
        self.delivered.lock().push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Drains pending outbox rows to the message bus.
///
/// Delivery is at-least-once: a row is marked delivered only after the bus
/// accepted it. A bus error stops the batch for that shard so later rows are
/// never delivered ahead of an earlier one; the next poll retries.
pub struct OutboxRelay<O: ?Sized, B: ?Sized> {
    store: Arc<O>,
    bus: Arc<B>,
    config: RelayConfig,
}

impl<O, B> OutboxRelay<O, B>
where
    O: OutboxStore + ?Sized,
    B: MessageBus + ?Sized,
{
    pub fn new(store: Arc<O>, bus: Arc<B>, config: RelayConfig) -> Self {
        Self { store, bus, config }
    }

    /// Runs one pass over every shard.
    pub async fn drain_once(&self) -> Result<RelayReport> {
        let mut report = RelayReport::default();
        for index in 0..self.store.outbox_shards() {
            let shard = ShardId::new(index);
            let shard_report = self.drain_shard(shard).await?;
            report.delivered += shard_report.delivered;
            report.failed += shard_report.failed;
        }
        Ok(report)
    }

    #[tracing::instrument(skip(self))]
    async fn drain_shard(&self, shard: ShardId) -> Result<RelayReport> {
        let pending = self
            .store
            .fetch_pending(shard, self.config.batch_size)
            .await?;
        let mut report = RelayReport::default();
        let mut delivered = Vec::with_capacity(pending.len());

        for message in &pending {
            match self.bus.publish(message).await {
                Ok(()) => delivered.push(message.id),
                Err(err) => {
                    tracing::warn!(
                        id = %message.id,
                        topic = %message.topic,
                        attempts = message.attempts + 1,
                        error = %err,
                        "outbox delivery failed"
                    );
                    self.store.record_failure(shard, message.id).await?;
                    metrics::counter!("outbox_delivery_failed_total").increment(1);
                    report.failed += 1;
                    break;
                }
            }
        }

        if !delivered.is_empty() {
            self.store.mark_delivered(shard, &delivered).await?;
            metrics::counter!("outbox_delivered_total").increment(delivered.len() as u64);
        }
        report.delivered = delivered.len();
        Ok(report)
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox relay started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.drain_once().await {
                        tracing::error!(error = %err, "outbox drain failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }
}
