//! Order commands.
//!
//! Every command is a read-modify-write of one order inside a transaction on
//! the shard that owns it. The row stays locked from the read to the commit,
//! so concurrent commands on the same order are serialized and the second
//! one is checked against the status the first one left behind.

use std::sync::Arc;

use common::{CustomerId, OrderId, OrderNo};
use domain::{Money, Order, PaymentMethod};
use order_store::{OrderFilter, OrderStore, OrderStoreExt, OrderTransaction, Page, PageResult};

use crate::error::{FulfillmentError, Result};

/// Operator recorded for transitions made by background tasks.
pub const SYSTEM_OPERATOR: &str = "system";

/// Cancellation reason written when the payment deadline passes.
pub const PAYMENT_TIMEOUT_REASON: &str = "Payment Timeout";

/// Result of a read-modify-write.
#[derive(Debug, Clone)]
pub struct Execution {
    /// The order as it was committed, or as it was read when nothing changed.
    pub order: Order,
    pub applied: bool,
}

pub struct OrderService<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for OrderService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> OrderService<S>
where
    S: OrderStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn get(&self, order_no: &OrderNo) -> Result<Order> {
        self.store
            .find_by_order_no(order_no)
            .await?
            .ok_or_else(|| FulfillmentError::OrderNotFound(order_no.to_string()))
    }

    pub async fn get_by_id(&self, id: OrderId) -> Result<Order> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| FulfillmentError::OrderNotFound(id.to_string()))
    }

    pub async fn list_for_customer(
        &self,
        customer_id: CustomerId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        Ok(self
            .store
            .list_by_customer(customer_id, filter, page)
            .await?)
    }

    /// Loads and locks `order_no`, applies `f` and saves the order if `f`
    /// reports a change.
    ///
    /// An error from `f` rolls the transaction back.
    pub async fn execute<F>(&self, order_no: &OrderNo, f: F) -> Result<Execution>
    where
        F: FnOnce(&mut Order) -> Result<bool> + Send + 'static,
    {
        let shard = self.store.router().check(order_no.shard())?;
        let order_no = order_no.clone();
        self.store
            .within_shard_transaction(shard, move |tx| {
                Box::pin(async move {
                    let mut order = tx
                        .find_order_for_update(&order_no)
                        .await?
                        .ok_or_else(|| FulfillmentError::OrderNotFound(order_no.to_string()))?;
                    let applied = f(&mut order)?;
                    if applied {
                        tx.save_order(&order).await?;
                    }
                    Ok(Execution { order, applied })
                })
            })
            .await
    }

    async fn apply<F>(&self, order_no: &OrderNo, f: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> std::result::Result<(), domain::OrderError> + Send + 'static,
    {
        let execution = self
            .execute(order_no, move |order| {
                f(order)?;
                Ok(true)
            })
            .await?;
        Ok(execution.order)
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn ship(
        &self,
        order_no: &OrderNo,
        operator: &str,
        tracking_no: Option<String>,
    ) -> Result<Order> {
        let operator = operator.to_string();
        self.apply(order_no, move |order| order.ship(&operator, tracking_no))
            .await
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn deliver(&self, order_no: &OrderNo, operator: &str) -> Result<Order> {
        let operator = operator.to_string();
        self.apply(order_no, move |order| order.deliver(&operator))
            .await
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn complete(&self, order_no: &OrderNo, operator: &str) -> Result<Order> {
        let operator = operator.to_string();
        self.apply(order_no, move |order| order.complete(&operator))
            .await
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn cancel(&self, order_no: &OrderNo, operator: &str, reason: &str) -> Result<Order> {
        let operator = operator.to_string();
        let reason = reason.to_string();
        let order = self
            .apply(order_no, move |order| order.cancel(&operator, reason))
            .await?;
        metrics::counter!("orders_cancelled_total").increment(1);
        Ok(order)
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn request_refund(
        &self,
        order_no: &OrderNo,
        operator: &str,
        reason: &str,
    ) -> Result<Order> {
        let operator = operator.to_string();
        let reason = reason.to_string();
        self.apply(order_no, move |order| order.request_refund(&operator, reason))
            .await
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn approve_refund(&self, order_no: &OrderNo, operator: &str) -> Result<Order> {
        let operator = operator.to_string();
        self.apply(order_no, move |order| order.approve_refund(&operator))
            .await
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn close(&self, order_no: &OrderNo, operator: &str) -> Result<Order> {
        let operator = operator.to_string();
        self.apply(order_no, move |order| order.close(&operator))
            .await
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn apply_discount(
        &self,
        order_no: &OrderNo,
        operator: &str,
        discount: Money,
    ) -> Result<Order> {
        let operator = operator.to_string();
        self.apply(order_no, move |order| order.apply_discount(&operator, discount))
            .await
    }

    /// Records a successful payment unless it was already recorded.
    pub async fn record_payment(
        &self,
        order_no: &OrderNo,
        method: PaymentMethod,
        payment_ref: String,
    ) -> Result<Execution> {
        self.execute(order_no, move |order| {
            if order.payment_ref() == Some(payment_ref.as_str()) {
                return Ok(false);
            }
            order.pay(SYSTEM_OPERATOR, method, Some(payment_ref))?;
            Ok(true)
        })
        .await
    }

    /// Cancels the order if it is still waiting for payment.
    ///
    /// Body of the payment timeout. An order paid or cancelled in the
    /// meantime is left alone.
    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn cancel_if_unpaid(&self, order_no: &OrderNo) -> Result<Execution> {
        self.execute(order_no, |order| {
            if !order.awaits_payment() {
                return Ok(false);
            }
            order.cancel(SYSTEM_OPERATOR, PAYMENT_TIMEOUT_REASON)?;
            Ok(true)
        })
        .await
    }
}
