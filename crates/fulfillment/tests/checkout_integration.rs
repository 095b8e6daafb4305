//! End-to-end checkout tests against the in-memory store and collaborators.

use std::sync::Arc;
use std::time::Duration;

use common::{CustomerId, IdGenerator, OrderNo};
use domain::{
    Money, ORDER_CREATED_TOPIC, Order, OrderError, OrderItem, OrderStatus, PAYMENT_TIMEOUT_TOPIC,
    PaymentMethod, PaymentTimeoutEvent, ShippingAddress, SkuId,
};
use fulfillment::services::{
    InMemoryCouponService, InMemoryPaymentService, InMemoryStockService, InProcessSagaLog,
    RecordingSagaLog, RiskAssessment, StaticRiskService, StaticWarehouseAllocator,
};
use fulfillment::{
    CallbackOutcome, Collaborators, CreateOrderRequest, ErrorKind, FulfillmentError,
    OrderService, PAYMENT_TIMEOUT_REASON, PaymentTimeouts, SagaCoordinator, SagaExecutor,
    SagaWorker,
};
use order_store::InMemoryOrderStore;
use timeout_wheel::{TimeoutWheel, WheelConfig};
use tokio::sync::watch;

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

struct TestHarness {
    store: Arc<InMemoryOrderStore>,
    wheel: Arc<TimeoutWheel>,
    coordinator: Arc<SagaCoordinator<InMemoryOrderStore>>,
    stock: InMemoryStockService,
    coupons: InMemoryCouponService,
    payments: InMemoryPaymentService,
    risk: StaticRiskService,
    saga_log: RecordingSagaLog,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_payment_timeout(FIFTEEN_MINUTES)
    }

    fn with_payment_timeout(timeout: Duration) -> Self {
        let store = Arc::new(InMemoryOrderStore::new(4).unwrap());
        let saga_log = RecordingSagaLog::new();
        Self::build(store, timeout, Arc::new(saga_log.clone()), saga_log)
    }

    fn build(
        store: Arc<InMemoryOrderStore>,
        timeout: Duration,
        log: Arc<dyn fulfillment::services::SagaLog>,
        saga_log: RecordingSagaLog,
    ) -> Self {
        let wheel = Arc::new(TimeoutWheel::new(test_wheel_config()).unwrap());
        let stock = InMemoryStockService::new()
            .with_stock("SKU-1", 100)
            .with_stock("SKU-2", 100);
        let coupons = InMemoryCouponService::new();
        let payments = InMemoryPaymentService::new();
        let risk = StaticRiskService::allow_all();

        let timeouts = PaymentTimeouts::new(
            Arc::clone(&wheel),
            OrderService::new(Arc::clone(&store)),
            timeout,
        );
        let services = Collaborators {
            stock: Arc::new(stock.clone()),
            coupons: Arc::new(coupons.clone()),
            payments: Arc::new(payments.clone()),
            risk: Arc::new(risk.clone()),
            saga_log: log,
            warehouses: Arc::new(StaticWarehouseAllocator::new("WH-MAIN")),
        };
        let coordinator = Arc::new(SagaCoordinator::new(
            Arc::clone(&store),
            Arc::new(IdGenerator::new(1).unwrap()),
            timeouts,
            services,
        ));

        Self {
            store,
            wheel,
            coordinator,
            stock,
            coupons,
            payments,
            risk,
            saga_log,
        }
    }

    fn executor(&self) -> SagaExecutor {
        SagaExecutor::new(Arc::new(self.stock.clone()), Arc::new(self.coupons.clone()))
    }

    /// Runs the last submitted saga and feeds its outcome back.
    async fn run_last_saga(&self) -> CallbackOutcome {
        let saga = self.saga_log.submitted().pop().unwrap();
        let outcome = self.executor().execute(&saga).await;
        self.coordinator
            .apply_saga_outcome(&saga.order_no, &outcome)
            .await
            .unwrap()
    }

    async fn order(&self, order_no: &OrderNo) -> Order {
        self.coordinator.orders().get(order_no).await.unwrap()
    }

    /// Creates an order and confirms its allocation.
    async fn pending_payment_order(&self, customer: i64) -> Order {
        let order = self.coordinator.create_order(checkout(customer)).await.unwrap();
        self.coordinator
            .handle_stock_reserved(order.order_no())
            .await
            .unwrap();
        self.order(order.order_no()).await
    }
}

fn test_wheel_config() -> WheelConfig {
    WheelConfig {
        tick: Duration::from_millis(10),
        slots: 64,
    }
}

fn address() -> ShippingAddress {
    ShippingAddress {
        receiver: "Sam".into(),
        phone: "555-0100".into(),
        province: "North".into(),
        city: "Porto".into(),
        detail: "Rua 1".into(),
        ..Default::default()
    }
}

fn checkout(customer: i64) -> CreateOrderRequest {
    CreateOrderRequest::new(
        CustomerId::new(customer),
        vec![
            OrderItem::new("P-1", "SKU-1", "Mug", 2, Money::from_minor(500)),
            OrderItem::new("P-2", "SKU-2", "Teapot", 1, Money::from_minor(1000)),
        ],
        address(),
    )
}

fn cancellations(order: &Order) -> usize {
    order
        .logs()
        .iter()
        .filter(|log| log.new_status == OrderStatus::Cancelled)
        .count()
}

#[tokio::test]
async fn test_checkout_allocates_then_confirms() {
    let h = TestHarness::new();

    let order = h.coordinator.create_order(checkout(42)).await.unwrap();
    assert_eq!(order.total_amount(), Money::from_minor(2000));
    assert_eq!(order.actual_amount(), Money::from_minor(2000));
    assert_eq!(order.status(), OrderStatus::Allocating);
    assert_eq!(h.risk.calls(), 1);
    assert_eq!(h.stock.locked(&SkuId::new("SKU-1")), 2);
    assert_eq!(h.stock.locked(&SkuId::new("SKU-2")), 1);

    let stored = h.order(order.order_no()).await;
    assert_eq!(stored, order);

    let outbox = h.store.outbox_for(order.order_no()).await.unwrap();
    let topics: Vec<&str> = outbox.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(topics, vec![ORDER_CREATED_TOPIC, PAYMENT_TIMEOUT_TOPIC]);
    assert!(outbox.iter().all(|m| m.dedup_key == order.order_no().as_str()));
    let timeout: PaymentTimeoutEvent = serde_json::from_value(outbox[1].payload.clone()).unwrap();
    assert_eq!(timeout.items.len(), 2);
    assert_eq!(timeout.expires_at, h.coordinator.timeouts().deadline_for(&order));

    let sagas = h.saga_log.submitted();
    assert_eq!(sagas.len(), 1);
    let keys: Vec<String> = sagas[0]
        .steps
        .iter()
        .map(|s| s.idempotency_key.clone())
        .collect();
    assert_eq!(
        keys,
        vec![
            format!("{}:0", order.order_no()),
            format!("{}:1", order.order_no())
        ]
    );
    assert!(h.wheel.is_scheduled(order.order_no().as_str()));

    let outcome = h
        .coordinator
        .handle_stock_reserved(order.order_no())
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);
    assert_eq!(
        h.order(order.order_no()).await.status(),
        OrderStatus::PendingPayment
    );
}

#[tokio::test]
async fn test_saga_submit_failure_cancels_order() {
    let h = TestHarness::new();
    h.saga_log.fail_next(1);

    let order = h.coordinator.create_order(checkout(42)).await.unwrap();

    assert_eq!(order.status(), OrderStatus::Cancelled);
    let remark = &order.last_log().unwrap().remark;
    assert!(remark.contains("Saga Submit Failed"), "remark was {remark}");
    assert_eq!(h.order(order.order_no()).await.status(), OrderStatus::Cancelled);
    assert_eq!(h.stock.deduct_calls(), 0);
    assert!(!h.wheel.is_scheduled(order.order_no().as_str()));
    assert_eq!(h.stock.locked(&SkuId::new("SKU-1")), 0);
    assert_eq!(h.stock.available(&SkuId::new("SKU-2")), 100);
}

#[tokio::test]
async fn test_unpaid_order_is_cancelled_by_timeout() {
    let h = TestHarness::with_payment_timeout(Duration::ZERO);
    let order = h.pending_payment_order(42).await;

    let report = h.wheel.advance().await;
    assert_eq!(report.fired, 1);

    let order = h.order(order.order_no()).await;
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason(), Some(PAYMENT_TIMEOUT_REASON));
}

#[tokio::test]
async fn test_timeout_on_paid_order_is_a_no_op() {
    let h = TestHarness::with_payment_timeout(Duration::ZERO);
    let order = h.pending_payment_order(42).await;
    let order_no = order.order_no().clone();

    let receipt = h
        .coordinator
        .initiate_payment(&order_no, PaymentMethod::Card)
        .await
        .unwrap();
    h.coordinator
        .handle_payment_processed(&order_no, PaymentMethod::Card, &receipt.transaction_ref)
        .await
        .unwrap();
    let paid = h.order(&order_no).await;
    assert_eq!(paid.status(), OrderStatus::Paid);

    // A timer that fires anyway re-reads the order and leaves it alone.
    h.coordinator.timeouts().schedule(&order_no, chrono::Utc::now());
    assert_eq!(h.wheel.advance().await.fired, 1);

    let after = h.order(&order_no).await;
    assert_eq!(after.status(), OrderStatus::Paid);
    assert_eq!(after.logs().len(), paid.logs().len());
}

#[tokio::test]
async fn test_duplicate_callbacks_are_no_ops() {
    let h = TestHarness::new();
    let order = h.coordinator.create_order(checkout(42)).await.unwrap();
    let order_no = order.order_no().clone();

    let first = h.coordinator.handle_stock_reserved(&order_no).await.unwrap();
    let second = h.coordinator.handle_stock_reserved(&order_no).await.unwrap();
    assert_eq!(first, CallbackOutcome::Applied);
    assert_eq!(second, CallbackOutcome::Duplicate);
    let confirmed = h.order(&order_no).await;
    assert_eq!(confirmed.logs().len(), 3);

    let first = h
        .coordinator
        .handle_payment_processed(&order_no, PaymentMethod::Wallet, "TXN-1")
        .await
        .unwrap();
    let second = h
        .coordinator
        .handle_payment_processed(&order_no, PaymentMethod::Wallet, "TXN-1")
        .await
        .unwrap();
    assert_eq!(first, CallbackOutcome::Applied);
    assert_eq!(second, CallbackOutcome::Duplicate);

    let paid = h.order(&order_no).await;
    assert_eq!(paid.status(), OrderStatus::Paid);
    assert_eq!(paid.payment_ref(), Some("TXN-1"));
    assert_eq!(paid.logs().len(), 4);
}

#[tokio::test]
async fn test_refund_on_cancelled_order_fails() {
    let h = TestHarness::new();
    let order = h.pending_payment_order(42).await;
    let order_no = order.order_no().clone();

    h.coordinator
        .cancel_order(&order_no, "customer:42", "changed my mind")
        .await
        .unwrap();
    let before = h.order(&order_no).await;

    let err = h
        .coordinator
        .orders()
        .request_refund(&order_no, "customer:42", "want money back")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FulfillmentError::Order(OrderError::InvalidStateTransition {
            current: OrderStatus::Cancelled,
            ..
        })
    ));
    assert_eq!(err.kind(), ErrorKind::Invariant);
    assert_eq!(h.order(&order_no).await, before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cancel_and_timeout_cancel_once() {
    let h = TestHarness::new();

    for customer in 0..20 {
        let order = h.pending_payment_order(customer).await;
        let order_no = order.order_no().clone();

        let user = {
            let coordinator = Arc::clone(&h.coordinator);
            let order_no = order_no.clone();
            tokio::spawn(async move {
                coordinator
                    .cancel_order(&order_no, "customer", "no longer needed")
                    .await
            })
        };
        let timeout = {
            let coordinator = Arc::clone(&h.coordinator);
            let order_no = order_no.clone();
            tokio::spawn(async move { coordinator.orders().cancel_if_unpaid(&order_no).await })
        };

        let user = user.await.unwrap();
        let timeout = timeout.await.unwrap().unwrap();

        match &user {
            Ok(_) => assert!(!timeout.applied),
            Err(err) => {
                assert!(err.is_invalid_transition(), "unexpected error {err}");
                assert!(timeout.applied);
            }
        }
        let order = h.order(&order_no).await;
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(cancellations(&order), 1);
    }
}

#[tokio::test]
async fn test_cancel_after_timeout_observes_invalid_transition() {
    let h = TestHarness::with_payment_timeout(Duration::ZERO);
    let order = h.pending_payment_order(42).await;
    h.wheel.advance().await;

    let err = h
        .coordinator
        .cancel_order(order.order_no(), "customer:42", "too late")
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());
    assert_eq!(cancellations(&h.order(order.order_no()).await), 1);
}

#[tokio::test]
async fn test_risk_reject_blocks_checkout() {
    let h = TestHarness::new();
    h.risk
        .set_answer(Some(RiskAssessment::reject("R-101", "velocity limit")));

    let err = h.coordinator.create_order(checkout(42)).await.unwrap_err();

    assert!(matches!(err, FulfillmentError::RiskRejected { ref code, .. } if code == "R-101"));
    assert_eq!(err.kind(), ErrorKind::Security);
    assert_eq!(h.store.order_count().await, 0);
    assert_eq!(h.stock.locked(&SkuId::new("SKU-1")), 0);
    assert!(h.saga_log.submitted().is_empty());
}

#[tokio::test]
async fn test_risk_outage_fails_open() {
    let h = TestHarness::new();
    h.risk.set_answer(None);

    let order = h.coordinator.create_order(checkout(42)).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Allocating);
    assert_eq!(h.risk.calls(), 1);
}

#[tokio::test]
async fn test_risk_review_does_not_block() {
    let h = TestHarness::new();
    h.risk
        .set_answer(Some(RiskAssessment::review("R-7", "new device")));

    let order = h.coordinator.create_order(checkout(42)).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Allocating);
}

#[tokio::test]
async fn test_insufficient_stock_rejects_without_side_effects() {
    let h = TestHarness::new();
    h.stock.set_stock("SKU-2", 0);

    let err = h.coordinator.create_order(checkout(42)).await.unwrap_err();

    assert!(matches!(
        err,
        FulfillmentError::InsufficientStock { ref sku, requested: 1, available: 0 } if sku == "SKU-2"
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.store.order_count().await, 0);
    assert_eq!(h.wheel.pending(), 0);
    // SKU-1 is the first line and was held before SKU-2 came up short.
    assert_eq!(h.stock.locked(&SkuId::new("SKU-1")), 0);
    assert_eq!(h.stock.available(&SkuId::new("SKU-1")), 100);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_any_call() {
    let h = TestHarness::new();
    let mut request = checkout(42);
    request.items.clear();

    let err = h.coordinator.create_order(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.risk.calls(), 0);
}

#[tokio::test]
async fn test_idempotency_key_replays_first_order() {
    let h = TestHarness::new();

    let first = h
        .coordinator
        .create_order(checkout(42).with_idempotency_key("cart-1"))
        .await
        .unwrap();
    let again = h
        .coordinator
        .create_order(checkout(42).with_idempotency_key("cart-1"))
        .await
        .unwrap();

    assert_eq!(first.order_no(), again.order_no());
    assert_eq!(h.store.order_count().await, 1);
    assert_eq!(h.saga_log.submitted().len(), 1);
    assert_eq!(h.stock.locked(&SkuId::new("SKU-1")), 2);

    // Another customer may use the same key.
    let other = h
        .coordinator
        .create_order(checkout(43).with_idempotency_key("cart-1"))
        .await
        .unwrap();
    assert_ne!(other.order_no(), first.order_no());
}

#[tokio::test]
async fn test_executed_saga_confirms_order() {
    let h = TestHarness::new();
    h.coupons.issue("SAVE10", CustomerId::new(42));
    let order = h
        .coordinator
        .create_order(checkout(42).with_coupon("SAVE10"))
        .await
        .unwrap();

    assert_eq!(h.run_last_saga().await, CallbackOutcome::Applied);

    let order = h.order(order.order_no()).await;
    assert_eq!(order.status(), OrderStatus::PendingPayment);
    assert_eq!(h.stock.deduction_count(), 2);
    assert_eq!(h.coupons.used_by("SAVE10"), Some(order.id()));
}

#[tokio::test]
async fn test_failed_saga_step_cancels_order() {
    let h = TestHarness::new();
    h.stock.fail_deduct_for("SKU-2");
    let order = h.coordinator.create_order(checkout(42)).await.unwrap();

    assert_eq!(h.run_last_saga().await, CallbackOutcome::Applied);

    let order = h.order(order.order_no()).await;
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert!(
        order
            .cancel_reason()
            .unwrap()
            .starts_with("Stock Reservation Failed")
    );
    assert_eq!(h.stock.deduction_count(), 0);
    assert!(!h.wheel.is_scheduled(order.order_no().as_str()));

    // The saga log may deliver the failure again.
    assert_eq!(
        h.coordinator
            .handle_stock_reservation_failed(order.order_no(), "again")
            .await
            .unwrap(),
        CallbackOutcome::Duplicate
    );
}

#[tokio::test]
async fn test_used_coupon_cancels_order() {
    let h = TestHarness::new();
    h.coupons.issue("SAVE10", CustomerId::new(42));
    let first = h
        .coordinator
        .create_order(checkout(42).with_coupon("SAVE10"))
        .await
        .unwrap();
    h.run_last_saga().await;
    let second = h
        .coordinator
        .create_order(checkout(42).with_coupon("SAVE10"))
        .await
        .unwrap();
    h.run_last_saga().await;

    assert_eq!(
        h.order(first.order_no()).await.status(),
        OrderStatus::PendingPayment
    );
    assert_eq!(
        h.order(second.order_no()).await.status(),
        OrderStatus::Cancelled
    );
    assert_eq!(h.coupons.used_by("SAVE10"), Some(first.id()));
}

#[tokio::test]
async fn test_payment_failure_cancels_order() {
    let h = TestHarness::new();
    let order = h.pending_payment_order(42).await;

    let outcome = h
        .coordinator
        .handle_payment_failed(order.order_no(), "card declined")
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Applied);

    let order = h.order(order.order_no()).await;
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason(), Some("Payment Failed: card declined"));
    assert!(!h.wheel.is_scheduled(order.order_no().as_str()));
}

#[tokio::test]
async fn test_initiate_payment_requires_confirmed_allocation() {
    let h = TestHarness::new();
    let order = h.coordinator.create_order(checkout(42)).await.unwrap();

    let err = h
        .coordinator
        .initiate_payment(order.order_no(), PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());

    h.coordinator
        .handle_stock_reserved(order.order_no())
        .await
        .unwrap();
    let first = h
        .coordinator
        .initiate_payment(order.order_no(), PaymentMethod::Card)
        .await
        .unwrap();
    let again = h
        .coordinator
        .initiate_payment(order.order_no(), PaymentMethod::Card)
        .await
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(h.payments.payment_count(), 1);
    assert_eq!(
        h.order(order.order_no()).await.status(),
        OrderStatus::PendingPayment
    );
}

#[tokio::test]
async fn test_rehydrate_restores_unpaid_timers() {
    let h = TestHarness::with_payment_timeout(Duration::ZERO);
    let unpaid = h.pending_payment_order(1).await;
    let allocating = h.coordinator.create_order(checkout(2)).await.unwrap();
    let paid = h.pending_payment_order(3).await;
    h.coordinator
        .handle_payment_processed(paid.order_no(), PaymentMethod::Card, "TXN-3")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // A restarted process starts with an empty wheel.
    let restarted = TestHarness::build(
        Arc::clone(&h.store),
        Duration::ZERO,
        Arc::new(RecordingSagaLog::new()),
        RecordingSagaLog::new(),
    );
    let restored = restarted
        .coordinator
        .timeouts()
        .rehydrate(Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(restored, 2);
    assert_eq!(restarted.wheel.pending(), 2);

    assert_eq!(restarted.wheel.advance().await.fired, 2);
    for order_no in [unpaid.order_no(), allocating.order_no()] {
        let order = restarted.order(order_no).await;
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.cancel_reason(), Some(PAYMENT_TIMEOUT_REASON));
    }
    assert_eq!(
        restarted.order(paid.order_no()).await.status(),
        OrderStatus::Paid
    );
}

#[tokio::test]
async fn test_rehydrate_skips_orders_inside_grace_window() {
    let h = TestHarness::new();
    h.pending_payment_order(1).await;

    let restored = h
        .coordinator
        .timeouts()
        .rehydrate(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(restored, 0);
}

#[tokio::test]
async fn test_saga_worker_drives_orders_end_to_end() {
    let store = Arc::new(InMemoryOrderStore::new(2).unwrap());
    let (log, receiver) = InProcessSagaLog::channel(16);
    let h = TestHarness::build(
        Arc::clone(&store),
        FIFTEEN_MINUTES,
        Arc::new(log),
        RecordingSagaLog::new(),
    );
    let worker = SagaWorker::new(receiver, h.executor(), Arc::clone(&h.coordinator));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let order = h.coordinator.create_order(checkout(42)).await.unwrap();

    let mut status = order.status();
    for _ in 0..100 {
        status = h.order(order.order_no()).await.status();
        if status == OrderStatus::PendingPayment {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, OrderStatus::PendingPayment);
    assert_eq!(h.stock.deduction_count(), 2);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
