use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CustomerId, OrderId, OrderNo, ShardId};
use domain::{Order, OrderRecord};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    OrderFilter, OrderStore, OrderTransaction, OutboxMessage, OutboxStore, Page, PageResult,
    Result, ShardRouter, StoreError,
};

#[derive(Default)]
struct ShardData {
    orders: HashMap<OrderNo, OrderRecord>,
    outbox: Vec<OutboxMessage>,
}

impl ShardData {
    fn load(&self, order_no: &OrderNo) -> Result<Option<Order>> {
        self.orders
            .get(order_no)
            .cloned()
            .map(Order::from_record)
            .transpose()
            .map_err(StoreError::from)
    }

    fn check_unique(&self, record: &OrderRecord) -> Result<()> {
        for existing in self.orders.values() {
            if existing.order_no == record.order_no {
                continue;
            }
            if existing.id == record.id {
                return Err(StoreError::DuplicateOrder(record.order_no.clone()));
            }
            if let Some(key) = &record.idempotency_key
                && existing.customer_id == record.customer_id
                && existing.idempotency_key.as_ref() == Some(key)
            {
                return Err(StoreError::DuplicateIdempotencyKey {
                    customer_id: record.customer_id,
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    fn select(
        &self,
        customer_id: Option<CustomerId>,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        let mut matching = Vec::new();
        for record in self.orders.values() {
            if customer_id.is_some_and(|c| c != record.customer_id) {
                continue;
            }
            let order = Order::from_record(record.clone())?;
            if filter.matches(&order) {
                matching.push(order);
            }
        }
        matching.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok(PageResult { items, total })
    }
}

/// In-memory order store for tests and single-node runs.
///
/// Each shard sits behind its own async mutex. A transaction holds its
/// shard's lock until it ends and stages writes, so readers see either all
/// of a transaction's writes or none of them.
#[derive(Clone)]
pub struct InMemoryOrderStore {
    router: ShardRouter,
    shards: Arc<Vec<Arc<Mutex<ShardData>>>>,
}

impl InMemoryOrderStore {
    pub fn new(shard_count: u16) -> Result<Self> {
        let router = ShardRouter::new(shard_count)?;
        let shards = (0..shard_count)
            .map(|_| Arc::new(Mutex::new(ShardData::default())))
            .collect();
        Ok(Self {
            router,
            shards: Arc::new(shards),
        })
    }

    fn shard(&self, shard: ShardId) -> Result<&Arc<Mutex<ShardData>>> {
        let shard = self.router.check(shard)?;
        self.shards
            .get(shard.index())
            .ok_or(StoreError::ShardOutOfRange {
                shard,
                shard_count: self.router.shard_count(),
            })
    }

    /// Returns the number of orders stored on every shard.
    pub async fn order_count(&self) -> usize {
        let mut count = 0;
        for shard in self.shards.iter() {
            count += shard.lock().await.orders.len();
        }
        count
    }

    /// Returns every outbox row on `shard` in creation order.
    pub async fn outbox_messages(&self, shard: ShardId) -> Result<Vec<OutboxMessage>> {
        Ok(self.shard(shard)?.lock().await.outbox.clone())
    }

    /// Returns outbox rows across all shards whose dedup key is `order_no`.
    pub async fn outbox_for(&self, order_no: &OrderNo) -> Result<Vec<OutboxMessage>> {
        let data = self.shard(order_no.shard())?.lock().await;
        Ok(data
            .outbox
            .iter()
            .filter(|m| m.dedup_key == order_no.as_str())
            .cloned()
            .collect())
    }
}

/// Transaction on one in-memory shard.
pub struct InMemoryTransaction {
    shard: ShardId,
    data: OwnedMutexGuard<ShardData>,
    staged_orders: Vec<OrderRecord>,
    staged_outbox: Vec<OutboxMessage>,
}

#[async_trait]
impl OrderTransaction for InMemoryTransaction {
    fn shard(&self) -> ShardId {
        self.shard
    }

    async fn find_order_for_update(&mut self, order_no: &OrderNo) -> Result<Option<Order>> {
        if order_no.shard() != self.shard {
            return Err(StoreError::WrongShard {
                order_no: order_no.clone(),
                shard: self.shard,
            });
        }
        if let Some(staged) = self
            .staged_orders
            .iter()
            .rev()
            .find(|r| &r.order_no == order_no)
        {
            return Ok(Some(Order::from_record(staged.clone())?));
        }
        self.data.load(order_no)
    }

    async fn save_order(&mut self, order: &Order) -> Result<()> {
        if order.order_no().shard() != self.shard {
            return Err(StoreError::WrongShard {
                order_no: order.order_no().clone(),
                shard: self.shard,
            });
        }
        let record = order.to_record();
        self.data.check_unique(&record)?;
        self.staged_orders.retain(|r| r.order_no != record.order_no);
        self.staged_orders.push(record);
        Ok(())
    }

    async fn insert_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        self.staged_outbox.push(message.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        for record in self.staged_orders.drain(..) {
            self.data.orders.insert(record.order_no.clone(), record);
        }
        let outbox = std::mem::take(&mut self.staged_outbox);
        self.data.outbox.extend(outbox);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    type Tx = InMemoryTransaction;

    fn router(&self) -> &ShardRouter {
        &self.router
    }

    async fn begin(&self, shard: ShardId) -> Result<Self::Tx> {
        let data = self.shard(shard)?.clone().lock_owned().await;
        Ok(InMemoryTransaction {
            shard,
            data,
            staged_orders: Vec::new(),
            staged_outbox: Vec::new(),
        })
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        let data = self.shard(id.shard())?.lock().await;
        data.orders
            .values()
            .find(|r| r.id == id)
            .cloned()
            .map(Order::from_record)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn find_by_order_no(&self, order_no: &OrderNo) -> Result<Option<Order>> {
        self.shard(order_no.shard())?.lock().await.load(order_no)
    }

    async fn find_by_idempotency_key(
        &self,
        customer_id: CustomerId,
        key: &str,
    ) -> Result<Option<Order>> {
        let shard = self.router.shard_for(customer_id);
        let data = self.shard(shard)?.lock().await;
        data.orders
            .values()
            .find(|r| r.customer_id == customer_id && r.idempotency_key.as_deref() == Some(key))
            .cloned()
            .map(Order::from_record)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list_by_customer(
        &self,
        customer_id: CustomerId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        let shard = self.router.shard_for(customer_id);
        self.shard(shard)?
            .lock()
            .await
            .select(Some(customer_id), filter, page)
    }

    async fn scan_shard(
        &self,
        shard: ShardId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>> {
        self.shard(shard)?.lock().await.select(None, filter, page)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOrderStore {
    fn outbox_shards(&self) -> u16 {
        self.router.shard_count()
    }

    async fn fetch_pending(&self, shard: ShardId, limit: usize) -> Result<Vec<OutboxMessage>> {
        let data = self.shard(shard)?.lock().await;
        Ok(data
            .outbox
            .iter()
            .filter(|m| m.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    /// Delivered rows are dropped; nothing reads them back in memory.
    async fn mark_delivered(&self, shard: ShardId, ids: &[Uuid]) -> Result<()> {
        let mut data = self.shard(shard)?.lock().await;
        data.outbox.retain(|m| !ids.contains(&m.id));
        Ok(())
    }

    async fn record_failure(&self, shard: ShardId, id: Uuid) -> Result<()> {
        let mut data = self.shard(shard)?.lock().await;
        if let Some(message) = data.outbox.iter_mut().find(|m| m.id == id) {
            message.attempts += 1;
        }
        Ok(())
    }
}
