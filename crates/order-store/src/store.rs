use async_trait::async_trait;
use common::{CustomerId, OrderId, OrderNo, ShardId};
use domain::Order;
use futures_util::future::BoxFuture;

use crate::{OrderFilter, OutboxMessage, Page, PageResult, Result, ShardRouter, StoreError};

/// Future returned by a transaction body.
pub type TxFuture<'t, T, E> = BoxFuture<'t, std::result::Result<T, E>>;

/// A unit of work open on exactly one shard.
///
/// Everything written through the handle becomes visible together on
/// [`commit`](OrderTransaction::commit) or not at all.
#[async_trait]
pub trait OrderTransaction: Send {
    fn shard(&self) -> ShardId;

    /// Loads an order and locks it until the transaction ends.
    async fn find_order_for_update(&mut self, order_no: &OrderNo) -> Result<Option<Order>>;

    /// Inserts or updates an order with its items and log.
    async fn save_order(&mut self, order: &Order) -> Result<()>;

    async fn insert_outbox(&mut self, message: &OutboxMessage) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Sharded persistence for orders.
///
/// Writes are routed by the owning customer. Lookups by id or order number
/// route by the shard embedded in the identifier.
#[async_trait]
pub trait OrderStore: Send + Sync {
    type Tx: OrderTransaction;

    fn router(&self) -> &ShardRouter;

    fn shard_count(&self) -> u16 {
        self.router().shard_count()
    }

    /// Opens a transaction on `shard`.
    async fn begin(&self, shard: ShardId) -> Result<Self::Tx>;

    /// Persists an order in its own transaction.
    async fn save(&self, order: &Order) -> Result<()> {
        let shard = self.router().shard_for(order.customer_id());
        let mut tx = self.begin(shard).await?;
        tx.save_order(order).await?;
        tx.commit().await
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>>;

    async fn find_by_order_no(&self, order_no: &OrderNo) -> Result<Option<Order>>;

    /// Finds the order a customer created with the given idempotency key.
    async fn find_by_idempotency_key(
        &self,
        customer_id: CustomerId,
        key: &str,
    ) -> Result<Option<Order>>;

    /// Lists a customer's orders, newest first.
    async fn list_by_customer(
        &self,
        customer_id: CustomerId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>>;

    /// Lists every order on one shard, newest first.
    async fn scan_shard(
        &self,
        shard: ShardId,
        filter: &OrderFilter,
        page: Page,
    ) -> Result<PageResult<Order>>;
}

/// Extension trait providing transaction scopes for order stores.
#[async_trait]
pub trait OrderStoreExt: OrderStore {
    /// Runs `f` inside a transaction on `shard`.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. A failed rollback
    /// is logged and the original error is returned.
    async fn within_shard_transaction<T, E, F>(
        &self,
        shard: ShardId,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Self::Tx) -> TxFuture<'t, T, E> + Send,
        T: Send,
        E: From<StoreError> + Send,
    {
        let mut tx = self.begin(shard).await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(%shard, error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` inside a transaction on the shard that owns `customer_id`.
    async fn within_transaction<T, E, F>(
        &self,
        customer_id: CustomerId,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Self::Tx) -> TxFuture<'t, T, E> + Send,
        T: Send,
        E: From<StoreError> + Send,
    {
        let shard = self.router().shard_for(customer_id);
        self.within_shard_transaction(shard, f).await
    }
}

// Blanket implementation for all OrderStore implementations
impl<S: OrderStore + ?Sized> OrderStoreExt for S {}
