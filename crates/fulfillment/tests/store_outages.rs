//! Checkout and saga callbacks while the order store is failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{CustomerId, IdGenerator, OrderId, OrderNo, ShardId};
use domain::{Money, Order, OrderItem, OrderStatus, ShippingAddress, SkuId};
use fulfillment::services::{
    InMemoryCouponService, InMemoryPaymentService, InMemoryStockService, InProcessSagaLog,
    RecordingSagaLog, SagaLog, StaticRiskService, StaticWarehouseAllocator,
};
use fulfillment::{
    Collaborators, CreateOrderRequest, FulfillmentError, OrderService, PAYMENT_TIMEOUT_REASON,
    PaymentTimeouts, SagaCoordinator, SagaDefinition, SagaExecutor, SagaWorker,
};
use order_store::{
    InMemoryOrderStore, InMemoryTransaction, OrderFilter, OrderStore, Page, PageResult,
    ShardRouter, StoreError,
};
use timeout_wheel::{TimeoutWheel, WheelConfig};

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

/// In-memory store whose transactions and reads can be made to fail.
struct FlakyStore {
    inner: InMemoryOrderStore,
    down: AtomicBool,
    failures_left: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryOrderStore::new(4).unwrap(),
            down: AtomicBool::new(false),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fails everything until switched back.
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fails the next `count` transactions.
    fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> order_store::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(outage());
        }
        Ok(())
    }
}

fn outage() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl OrderStore for FlakyStore {
    type Tx = InMemoryTransaction;

    fn router(&self) -> &ShardRouter {
        self.inner.router()
    }

    async fn begin(&self, shard: ShardId) -> order_store::Result<InMemoryTransaction> {
        self.check()?;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(outage());
        }
        self.inner.begin(shard).await
    }

    async fn find_by_id(&self, id: OrderId) -> order_store::Result<Option<Order>> {
        self.check()?;
        self.inner.find_by_id(id).await
    }

    async fn find_by_order_no(&self, order_no: &OrderNo) -> order_store::Result<Option<Order>> {
        self.check()?;
        self.inner.find_by_order_no(order_no).await
    }

    async fn find_by_idempotency_key(
        &self,
        customer_id: CustomerId,
        key: &str,
    ) -> order_store::Result<Option<Order>> {
        self.check()?;
        self.inner.find_by_idempotency_key(customer_id, key).await
    }

    async fn list_by_customer(
        &self,
        customer_id: CustomerId,
        filter: &OrderFilter,
        page: Page,
    ) -> order_store::Result<PageResult<Order>> {
        self.check()?;
        self.inner.list_by_customer(customer_id, filter, page).await
    }

    async fn scan_shard(
        &self,
        shard: ShardId,
        filter: &OrderFilter,
        page: Page,
    ) -> order_store::Result<PageResult<Order>> {
        self.check()?;
        self.inner.scan_shard(shard, filter, page).await
    }
}

/// Saga log whose submission fails and takes the order store down with it.
struct OutageSagaLog {
    store: Arc<FlakyStore>,
}

#[async_trait]
impl SagaLog for OutageSagaLog {
    async fn submit(&self, _saga: SagaDefinition) -> fulfillment::Result<()> {
        self.store.set_down(true);
        Err(FulfillmentError::service("saga log", "connection reset by peer"))
    }
}

struct Harness {
    store: Arc<FlakyStore>,
    wheel: Arc<TimeoutWheel>,
    coordinator: Arc<SagaCoordinator<FlakyStore>>,
    stock: InMemoryStockService,
    coupons: InMemoryCouponService,
    saga_log: RecordingSagaLog,
}

impl Harness {
    fn new() -> Self {
        let saga_log = RecordingSagaLog::new();
        Self::build(
            Arc::new(FlakyStore::new()),
            FIFTEEN_MINUTES,
            Arc::new(saga_log.clone()),
            saga_log,
        )
    }

    fn build(
        store: Arc<FlakyStore>,
        timeout: Duration,
        log: Arc<dyn SagaLog>,
        saga_log: RecordingSagaLog,
    ) -> Self {
        let wheel = Arc::new(
            TimeoutWheel::new(WheelConfig {
                tick: Duration::from_millis(10),
                slots: 64,
            })
            .unwrap(),
        );
        let stock = InMemoryStockService::new()
            .with_stock("SKU-1", 100)
            .with_stock("SKU-2", 100);
        let coupons = InMemoryCouponService::new();

        let timeouts = PaymentTimeouts::new(
            Arc::clone(&wheel),
            OrderService::new(Arc::clone(&store)),
            timeout,
        );
        let services = Collaborators {
            stock: Arc::new(stock.clone()),
            coupons: Arc::new(coupons.clone()),
            payments: Arc::new(InMemoryPaymentService::new()),
            risk: Arc::new(StaticRiskService::allow_all()),
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
            saga_log,
        }
    }

    fn worker(&self) -> SagaWorker<FlakyStore> {
        let (_log, receiver) = InProcessSagaLog::channel(1);
        let executor =
            SagaExecutor::new(Arc::new(self.stock.clone()), Arc::new(self.coupons.clone()));
        SagaWorker::new(receiver, executor, Arc::clone(&self.coordinator))
            .with_retry(3, Duration::from_millis(1))
    }

    async fn order(&self, order_no: &OrderNo) -> Order {
        self.coordinator.orders().get(order_no).await.unwrap()
    }

    async fn orders_of(&self, customer: i64) -> Vec<Order> {
        self.store
            .inner
            .list_by_customer(CustomerId::new(customer), &OrderFilter::default(), Page::default())
            .await
            .unwrap()
            .items
    }
}

fn checkout(customer: i64) -> CreateOrderRequest {
    CreateOrderRequest::new(
        CustomerId::new(customer),
        vec![
            OrderItem::new("P-1", "SKU-1", "Mug", 2, Money::from_minor(500)),
            OrderItem::new("P-2", "SKU-2", "Teapot", 1, Money::from_minor(1000)),
        ],
        ShippingAddress {
            receiver: "Sam".into(),
            phone: "555-0100".into(),
            province: "North".into(),
            city: "Porto".into(),
            detail: "Rua 1".into(),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_failed_submit_and_failed_cancel_leave_the_timeout_armed() {
    let store = Arc::new(FlakyStore::new());
    let log = Arc::new(OutageSagaLog {
        store: Arc::clone(&store),
    });
    let h = Harness::build(store, Duration::ZERO, log, RecordingSagaLog::new());

    let err = h.coordinator.create_order(checkout(42)).await.unwrap_err();
    assert!(matches!(err, FulfillmentError::Store(_)), "got {err:?}");

    h.store.set_down(false);
    let orders = h.orders_of(42).await;
    assert_eq!(orders.len(), 1);
    let order_no = orders[0].order_no().clone();
    assert_eq!(orders[0].status(), OrderStatus::Allocating);
    assert!(h.wheel.is_scheduled(order_no.as_str()));

    let report = h.wheel.advance().await;
    assert_eq!(report.fired, 1);

    let order = h.order(&order_no).await;
    assert_eq!(order.status(), OrderStatus::Cancelled);
    assert_eq!(order.cancel_reason(), Some(PAYMENT_TIMEOUT_REASON));
}

#[tokio::test]
async fn test_failed_persist_releases_held_stock() {
    let h = Harness::new();
    h.store.fail_next(1);

    let err = h.coordinator.create_order(checkout(42)).await.unwrap_err();

    assert!(matches!(err, FulfillmentError::Store(_)), "got {err:?}");
    assert!(h.orders_of(42).await.is_empty());
    assert_eq!(h.wheel.pending(), 0);
    for sku in ["SKU-1", "SKU-2"] {
        let sku = SkuId::new(sku);
        assert_eq!(h.stock.locked(&sku), 0);
        assert_eq!(h.stock.available(&sku), 100);
    }
}

#[tokio::test]
async fn test_worker_retries_outcome_after_transient_store_error() {
    let h = Harness::new();
    let order = h.coordinator.create_order(checkout(42)).await.unwrap();
    let saga = h.saga_log.submitted().pop().unwrap();

    h.store.fail_next(1);
    h.worker().process(&saga).await;

    assert_eq!(
        h.order(order.order_no()).await.status(),
        OrderStatus::PendingPayment
    );
    assert_eq!(h.stock.deduction_count(), 2);
}

#[tokio::test]
async fn test_worker_compensates_when_outcome_cannot_be_recorded() {
    let h = Harness::new();
    let order = h.coordinator.create_order(checkout(42)).await.unwrap();
    let saga = h.saga_log.submitted().pop().unwrap();

    h.store.set_down(true);
    h.worker().process(&saga).await;
    h.store.set_down(false);

    assert_eq!(h.stock.deduction_count(), 0);
    assert_eq!(h.stock.deduct_calls(), 2);
    for sku in ["SKU-1", "SKU-2"] {
        assert_eq!(h.stock.available(&SkuId::new(sku)), 100);
    }
    assert_eq!(
        h.order(order.order_no()).await.status(),
        OrderStatus::Allocating
    );
    assert!(h.wheel.is_scheduled(order.order_no().as_str()));
}
