//! Payment deadlines on the timeout wheel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common::OrderNo;
use domain::Order;
use order_store::{OrderFilter, OrderStore, Page};
use timeout_wheel::TimeoutWheel;

use crate::error::Result;
use crate::orders::OrderService;

/// Registers "cancel if still unpaid" timers and restores them after a restart.
pub struct PaymentTimeouts<S: ?Sized> {
    wheel: Arc<TimeoutWheel>,
    orders: OrderService<S>,
    timeout: Duration,
}

impl<S: ?Sized> Clone for PaymentTimeouts<S> {
    fn clone(&self) -> Self {
        Self {
            wheel: Arc::clone(&self.wheel),
            orders: self.orders.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S> PaymentTimeouts<S>
where
    S: OrderStore + 'static,
{
    pub fn new(wheel: Arc<TimeoutWheel>, orders: OrderService<S>, timeout: Duration) -> Self {
        Self {
            wheel,
            orders,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn wheel(&self) -> &Arc<TimeoutWheel> {
        &self.wheel
    }

    /// When `order` stops waiting for payment.
    pub fn deadline_for(&self, order: &Order) -> DateTime<Utc> {
        TimeDelta::from_std(self.timeout)
            .ok()
            .and_then(|timeout| order.created_at().checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Schedules the timeout of `order_no`. A deadline in the past fires on
    /// the next tick.
    pub fn schedule(&self, order_no: &OrderNo, deadline: DateTime<Utc>) {
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let orders = self.orders.clone();
        let key = order_no.clone();

        self.wheel
            .schedule_timeout(order_no.to_string(), delay, move || async move {
                match orders.cancel_if_unpaid(&key).await {
                    Ok(execution) if execution.applied => {
                        metrics::counter!("payment_timeouts_total").increment(1);
                        tracing::info!(order_no = %key, "unpaid order cancelled");
                    }
                    Ok(execution) => {
                        tracing::debug!(
                            order_no = %key,
                            status = %execution.order.status(),
                            "payment timeout found order settled"
                        );
                    }
                    Err(err) => {
                        tracing::error!(order_no = %key, error = %err, "payment timeout failed");
                    }
                }
            });
        tracing::debug!(%order_no, delay_ms = delay.as_millis() as u64, "payment timeout scheduled");
    }

    /// Drops the timer of an order that no longer needs it.
    pub fn cancel(&self, order_no: &OrderNo) -> bool {
        self.wheel.cancel(order_no.as_str())
    }

    /// Re-registers timers for orders still waiting for payment.
    ///
    /// Scans every shard for `PendingPayment`/`Allocating` orders created
    /// more than `grace` ago and schedules each at its original deadline.
    #[tracing::instrument(skip(self))]
    pub async fn rehydrate(&self, grace: Duration) -> Result<usize> {
        let cutoff = TimeDelta::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let filter = OrderFilter::awaiting_payment().created_before(cutoff);
        let store = self.orders.store();
        let mut restored = 0;

        for shard in store.router().shards() {
            let mut page = Page::default();
            loop {
                let result = store.scan_shard(shard, &filter, page).await?;
                for order in &result.items {
                    self.schedule(order.order_no(), self.deadline_for(order));
                    restored += 1;
                }
                if !result.has_more(page) {
                    break;
                }
                page = page.next();
            }
        }

        metrics::counter!("payment_timeouts_rehydrated_total").increment(restored as u64);
        tracing::info!(restored, "payment timeouts rehydrated");
        Ok(restored)
    }
}
