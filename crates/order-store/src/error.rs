use common::{CustomerId, OrderNo, ShardId};
use domain::OrderError;
use thiserror::Error;

/// Errors that can occur when interacting with the order store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The shard index is not served by this store.
    #[error("Shard {shard} out of range (store has {shard_count} shards)")]
    ShardOutOfRange { shard: ShardId, shard_count: u16 },

    /// The shard count is outside 1..=64 or does not match the configured backends.
    #[error("Invalid shard configuration: {0}")]
    InvalidShardConfig(String),

    /// The order id was already used by another order number.
    #[error("Duplicate order: {0}")]
    DuplicateOrder(OrderNo),

    /// The customer already has an order with this idempotency key.
    #[error("Customer {customer_id} already used idempotency key {key}")]
    DuplicateIdempotencyKey { customer_id: CustomerId, key: String },

    /// The order number does not belong to the shard the transaction is open on.
    #[error("Order {order_no} does not live on shard {shard}")]
    WrongShard { order_no: OrderNo, shard: ShardId },

    /// A stored row could not be turned back into a domain value.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A stored order failed its invariant checks.
    #[error("Corrupt order: {0}")]
    Corrupt(#[from] OrderError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for order store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
