//! Checkout orchestration and saga callbacks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::{CustomerId, IdGenerator, OrderNo};
use domain::{
    Money, NewOrder, Order, OrderCreatedEvent, OrderItem, OrderStatus, PaymentMethod,
    PaymentTimeoutEvent, ShippingAddress, SkuId,
};
use order_store::{OrderStore, OrderStoreExt, OrderTransaction, OutboxPublisher, StoreError};

use crate::error::{FulfillmentError, Result};
use crate::orders::{OrderService, SYSTEM_OPERATOR};
use crate::services::{
    CouponService, LockOutcome, ORDER_CREATE_ACTION, PaymentReceipt, PaymentRequest,
    PaymentService, RiskContext, RiskLevel, RiskService, SagaLog, StockService,
    WarehouseAllocator,
};
use crate::timeouts::PaymentTimeouts;

use super::definition::SagaDefinition;
use super::executor::SagaOutcome;

const SAGA_OPERATOR: &str = "saga";

/// Whether a callback changed the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Applied,
    /// Already applied, or overtaken by a later transition.
    Duplicate,
}

impl CallbackOutcome {
    fn from_applied(applied: bool) -> Self {
        if applied {
            Self::Applied
        } else {
            Self::Duplicate
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
        }
    }
}

/// What committing a checkout produced.
enum Placement {
    Created {
        order: Order,
        saga: SagaDefinition,
        deadline: DateTime<Utc>,
    },
    /// A concurrent retry with the same idempotency key committed first.
    Replayed(Order),
}

/// Checkout input.
#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,
    pub shipping_fee: Money,
    pub discount_amount: Money,
    pub coupon_code: Option<String>,
    /// Retrying with the same key returns the order created first.
    pub idempotency_key: Option<String>,
    pub remark: Option<String>,
    pub client_ip: Option<String>,
    pub device_id: Option<String>,
}

impl CreateOrderRequest {
    pub fn new(
        customer_id: CustomerId,
        items: Vec<OrderItem>,
        shipping_address: ShippingAddress,
    ) -> Self {
        Self {
            customer_id,
            items,
            shipping_address,
            shipping_fee: Money::zero(),
            discount_amount: Money::zero(),
            coupon_code: None,
            idempotency_key: None,
            remark: None,
            client_ip: None,
            device_id: None,
        }
    }

    pub fn with_coupon(mut self, code: impl Into<String>) -> Self {
        self.coupon_code = Some(code.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(FulfillmentError::Validation("order has no items".into()));
        }
        if let Some(item) = self.items.iter().find(|item| item.quantity == 0) {
            return Err(FulfillmentError::Validation(format!(
                "quantity of {} must be greater than 0",
                item.sku_id
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(FulfillmentError::Validation(
                    "idempotency key must not be blank".into(),
                ));
            }
        }
        if !self.shipping_address.is_deliverable() {
            return Err(FulfillmentError::Validation(
                "shipping address is incomplete".into(),
            ));
        }
        Ok(())
    }

    fn risk_context(&self) -> RiskContext {
        RiskContext {
            customer_id: Some(self.customer_id),
            client_ip: self.client_ip.clone(),
            device_id: self.device_id.clone(),
        }
    }

    fn risk_attributes(&self) -> BTreeMap<String, String> {
        let quantity: u64 = self.items.iter().map(|item| u64::from(item.quantity)).sum();
        let mut attributes = BTreeMap::new();
        attributes.insert("item_count".to_string(), self.items.len().to_string());
        attributes.insert("quantity".to_string(), quantity.to_string());
        attributes.insert("city".to_string(), self.shipping_address.city.clone());
        if let Some(code) = &self.coupon_code {
            attributes.insert("coupon_code".to_string(), code.clone());
        }
        attributes
    }
}

/// The services a checkout talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub stock: Arc<dyn StockService>,
    pub coupons: Arc<dyn CouponService>,
    pub payments: Arc<dyn PaymentService>,
    pub risk: Arc<dyn RiskService>,
    pub saga_log: Arc<dyn SagaLog>,
    pub warehouses: Arc<dyn WarehouseAllocator>,
}

/// Turns a checkout into a committed order and drives it from the saga's
/// callbacks.
///
/// The coordinator keeps no state about sagas in flight. Everything it needs
/// to resume is the order number carried by the callback.
pub struct SagaCoordinator<S: ?Sized> {
    store: Arc<S>,
    orders: OrderService<S>,
    timeouts: PaymentTimeouts<S>,
    ids: Arc<IdGenerator>,
    services: Collaborators,
}

impl<S> SagaCoordinator<S>
where
    S: OrderStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        ids: Arc<IdGenerator>,
        timeouts: PaymentTimeouts<S>,
        services: Collaborators,
    ) -> Self {
        let orders = OrderService::new(Arc::clone(&store));
        Self {
            store,
            orders,
            timeouts,
            ids,
            services,
        }
    }

    pub fn orders(&self) -> &OrderService<S> {
        &self.orders
    }

    pub fn timeouts(&self) -> &PaymentTimeouts<S> {
        &self.timeouts
    }

    /// Creates an order and starts its allocation saga.
    ///
    /// Returns the order in `Allocating`, or in `Cancelled` when the saga
    /// could not be submitted after the order was committed. Rejections
    /// before the commit leave nothing behind; stock held for them is
    /// released.
    #[tracing::instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order> {
        let started = Instant::now();
        request.validate()?;

        if let Some(existing) = self.replay(&request).await? {
            return Ok(existing);
        }

        self.check_risk(&request).await?;
        let held = self.lock_stock(&request).await?;

        let (order, saga, deadline) = match self.place_order(request).await {
            Ok(Placement::Created {
                order,
                saga,
                deadline,
            }) => (order, saga, deadline),
            Ok(Placement::Replayed(existing)) => {
                self.release_stock(&held).await;
                return Ok(existing);
            }
            Err(err) => {
                self.release_stock(&held).await;
                return Err(err);
            }
        };
        metrics::counter!("orders_created_total").increment(1);
        tracing::info!(order_no = %order.order_no(), total = %order.total_amount(), "order created");

        // From here on the timer is the backstop for every failure below.
        let order_no = order.order_no().clone();
        self.timeouts.schedule(&order_no, deadline);

        if let Err(err) = self.services.saga_log.submit(saga).await {
            metrics::counter!("saga_submit_failed_total").increment(1);
            tracing::error!(%order_no, error = %err, "saga submission failed, cancelling order");
            let reason = format!("Saga Submit Failed: {err}");
            let cancelled = self.orders.cancel(&order_no, SYSTEM_OPERATOR, &reason).await?;
            self.timeouts.cancel(&order_no);
            self.release_stock(&held).await;
            return Ok(cancelled);
        }
        metrics::counter!("saga_submitted_total").increment(1);

        metrics::histogram!("order_create_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(order)
    }

    /// Builds the order and its saga and commits the order with its events.
    async fn place_order(&self, request: CreateOrderRequest) -> Result<Placement> {
        let warehouses = self.resolve_warehouses(&request).await?;

        let shard = self.store.router().shard_for(request.customer_id);
        let (id, order_no) = self.ids.next_order(shard)?;
        let mut order = Order::create(
            NewOrder {
                id,
                order_no,
                customer_id: request.customer_id,
                items: request.items,
                shipping_address: request.shipping_address,
                shipping_fee: request.shipping_fee,
                discount_amount: request.discount_amount,
                coupon_code: request.coupon_code,
                idempotency_key: request.idempotency_key,
                remark: request.remark,
            },
            &format!("customer:{}", request.customer_id),
        )?;
        order.allocate(SAGA_OPERATOR)?;
        let saga = SagaDefinition::for_order(&order, &warehouses)?;
        let deadline = self.timeouts.deadline_for(&order);

        match self.persist_new_order(&order, deadline).await {
            Ok(()) => Ok(Placement::Created {
                order,
                saga,
                deadline,
            }),
            Err(FulfillmentError::Store(StoreError::DuplicateIdempotencyKey { .. })) => {
                // Lost a race with a concurrent retry of the same checkout.
                match self.replay_stored(&order).await? {
                    Some(existing) => Ok(Placement::Replayed(existing)),
                    None => Err(FulfillmentError::Validation(
                        "idempotency key already used".into(),
                    )),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn replay(&self, request: &CreateOrderRequest) -> Result<Option<Order>> {
        let Some(key) = &request.idempotency_key else {
            return Ok(None);
        };
        let existing = self
            .store
            .find_by_idempotency_key(request.customer_id, key)
            .await?;
        if let Some(order) = &existing {
            metrics::counter!("orders_replayed_total").increment(1);
            tracing::info!(order_no = %order.order_no(), "checkout replayed");
        }
        Ok(existing)
    }

    async fn replay_stored(&self, order: &Order) -> Result<Option<Order>> {
        match order.idempotency_key() {
            Some(key) => Ok(self
                .store
                .find_by_idempotency_key(order.customer_id(), key)
                .await?),
            None => Ok(None),
        }
    }

    /// Fails open: an unreachable risk service does not block checkout.
    async fn check_risk(&self, request: &CreateOrderRequest) -> Result<()> {
        let assessment = self
            .services
            .risk
            .assess(
                &request.risk_context(),
                ORDER_CREATE_ACTION,
                &request.risk_attributes(),
            )
            .await;

        match assessment {
            Ok(assessment) => match assessment.level {
                RiskLevel::Allow => Ok(()),
                RiskLevel::Review => {
                    metrics::counter!("risk_gate_review_total").increment(1);
                    tracing::warn!(
                        code = %assessment.code,
                        reason = %assessment.reason,
                        "checkout flagged for review"
                    );
                    Ok(())
                }
                RiskLevel::Reject => {
                    metrics::counter!("risk_gate_rejected_total").increment(1);
                    tracing::warn!(code = %assessment.code, "checkout rejected by risk control");
                    Err(FulfillmentError::RiskRejected {
                        code: assessment.code,
                        reason: assessment.reason,
                    })
                }
            },
            Err(err) => {
                metrics::counter!("risk_gate_fail_open_total").increment(1);
                tracing::warn!(error = %err, "risk service unavailable, failing open");
                Ok(())
            }
        }
    }

    /// Holds stock for every line before anything is written.
    ///
    /// All or nothing: when a line cannot be held, the lines held before it
    /// are released.
    async fn lock_stock(&self, request: &CreateOrderRequest) -> Result<Vec<(SkuId, u32)>> {
        let mut held = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let outcome = self
                .services
                .stock
                .lock_stock(&item.sku_id, item.quantity, "checkout")
                .await;
            match outcome {
                Ok(LockOutcome::Locked) => held.push((item.sku_id.clone(), item.quantity)),
                Ok(LockOutcome::Insufficient { available }) => {
                    metrics::counter!("stock_prelock_rejected_total").increment(1);
                    self.release_stock(&held).await;
                    return Err(FulfillmentError::InsufficientStock {
                        sku: item.sku_id.to_string(),
                        requested: item.quantity,
                        available,
                    });
                }
                Err(err) => {
                    self.release_stock(&held).await;
                    return Err(err);
                }
            }
        }
        Ok(held)
    }

    /// Gives held stock back. A failed release is logged; the stock service
    /// expires locks nobody consumes.
    async fn release_stock(&self, held: &[(SkuId, u32)]) {
        for (sku, quantity) in held {
            if let Err(err) = self.services.stock.release_stock(sku, *quantity).await {
                metrics::counter!("stock_release_failed_total").increment(1);
                tracing::warn!(%sku, quantity, error = %err, "stock release failed");
            }
        }
    }

    async fn resolve_warehouses(&self, request: &CreateOrderRequest) -> Result<Vec<String>> {
        let mut warehouses = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let warehouse = self
                .services
                .warehouses
                .warehouse_for(&item.sku_id, item.quantity, &request.shipping_address)
                .await?;
            warehouses.push(warehouse);
        }
        Ok(warehouses)
    }

    /// Writes the order and both of its events in one transaction.
    async fn persist_new_order(
        &self,
        order: &Order,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        let created = OrderCreatedEvent::from_order(order);
        let timeout = PaymentTimeoutEvent::from_order(order, deadline);
        let order = order.clone();

        self.store
            .within_transaction(order.customer_id(), move |tx| {
                Box::pin(async move {
                    tx.save_order(&order).await?;
                    OutboxPublisher::publish_event(tx, &created).await?;
                    OutboxPublisher::publish_event(tx, &timeout).await?;
                    Ok::<_, FulfillmentError>(())
                })
            })
            .await
    }

    /// Starts the payment of an order that finished allocation.
    ///
    /// The order only moves to `Paid` once
    /// [`handle_payment_processed`](Self::handle_payment_processed) arrives.
    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn initiate_payment(
        &self,
        order_no: &OrderNo,
        method: PaymentMethod,
    ) -> Result<PaymentReceipt> {
        let order = self.orders.get(order_no).await?;
        if order.status() != OrderStatus::PendingPayment {
            return Err(domain::OrderError::InvalidStateTransition {
                current: order.status(),
                action: domain::OrderAction::Pay,
            }
            .into());
        }

        let request = PaymentRequest {
            order_id: order.id(),
            customer_id: order.customer_id(),
            method,
            amount: order.actual_amount(),
            idempotency_key: format!("{order_no}:pay"),
        };
        self.services.payments.initiate_payment(&request).await
    }

    /// Cancels on behalf of a user or operator and drops the payment timer.
    pub async fn cancel_order(
        &self,
        order_no: &OrderNo,
        operator: &str,
        reason: &str,
    ) -> Result<Order> {
        let order = self.orders.cancel(order_no, operator, reason).await?;
        self.timeouts.cancel(order_no);
        Ok(order)
    }

    /// Every allocation step succeeded.
    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn handle_stock_reserved(&self, order_no: &OrderNo) -> Result<CallbackOutcome> {
        let execution = self
            .orders
            .execute(order_no, |order| {
                if order.status() != OrderStatus::Allocating {
                    return Ok(false);
                }
                order.confirm(SAGA_OPERATOR)?;
                Ok(true)
            })
            .await?;
        Ok(record_callback("stock_reserved", execution.applied))
    }

    /// An allocation step failed and the saga compensated.
    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn handle_stock_reservation_failed(
        &self,
        order_no: &OrderNo,
        reason: &str,
    ) -> Result<CallbackOutcome> {
        let reason = format!("Stock Reservation Failed: {reason}");
        let execution = self
            .orders
            .execute(order_no, move |order| {
                if order.status() != OrderStatus::Allocating {
                    return Ok(false);
                }
                order.cancel(SAGA_OPERATOR, reason)?;
                Ok(true)
            })
            .await?;
        if execution.applied {
            self.timeouts.cancel(order_no);
        }
        Ok(record_callback("stock_reservation_failed", execution.applied))
    }

    /// The payment service confirmed a payment.
    ///
    /// A payment for an order that was cancelled in the meantime fails with
    /// `InvalidStateTransition`; the payment has to be refunded.
    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn handle_payment_processed(
        &self,
        order_no: &OrderNo,
        method: PaymentMethod,
        transaction_ref: &str,
    ) -> Result<CallbackOutcome> {
        let execution = self
            .orders
            .record_payment(order_no, method, transaction_ref.to_string())
            .await?;
        if execution.applied {
            self.timeouts.cancel(order_no);
            metrics::counter!("orders_paid_total").increment(1);
        }
        Ok(record_callback("payment_processed", execution.applied))
    }

    #[tracing::instrument(skip(self, order_no), fields(%order_no))]
    pub async fn handle_payment_failed(
        &self,
        order_no: &OrderNo,
        reason: &str,
    ) -> Result<CallbackOutcome> {
        let reason = format!("Payment Failed: {reason}");
        let execution = self
            .orders
            .execute(order_no, move |order| {
                if !order.awaits_payment() {
                    return Ok(false);
                }
                order.cancel(SYSTEM_OPERATOR, reason)?;
                Ok(true)
            })
            .await?;
        if execution.applied {
            self.timeouts.cancel(order_no);
        }
        Ok(record_callback("payment_failed", execution.applied))
    }

    /// Routes an executed saga's outcome to the matching callback.
    pub async fn apply_saga_outcome(
        &self,
        order_no: &OrderNo,
        outcome: &SagaOutcome,
    ) -> Result<CallbackOutcome> {
        match outcome {
            SagaOutcome::Completed => self.handle_stock_reserved(order_no).await,
            SagaOutcome::Compensated {
                failed_step,
                reason,
                compensation_failures,
            } => {
                if !compensation_failures.is_empty() {
                    tracing::error!(
                        %order_no,
                        steps = ?compensation_failures,
                        "saga compensation incomplete"
                    );
                }
                let reason = format!("step {failed_step}: {reason}");
                self.handle_stock_reservation_failed(order_no, &reason).await
            }
        }
    }
}

fn record_callback(callback: &'static str, applied: bool) -> CallbackOutcome {
    let outcome = CallbackOutcome::from_applied(applied);
    metrics::counter!(
        "saga_callbacks_total",
        "callback" => callback,
        "outcome" => outcome.as_str()
    )
    .increment(1);
    if !applied {
        tracing::debug!(callback, "callback already applied");
    }
    outcome
}
