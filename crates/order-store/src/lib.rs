pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod query;
pub mod shard;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryOrderStore, InMemoryTransaction};
pub use outbox::{
    BusError, DeliveryStatus, InMemoryMessageBus, MessageBus, OutboxMessage, OutboxPublisher,
    OutboxRelay, OutboxStore, RelayConfig, RelayReport,
};
pub use postgres::{PgOrderStore, PgTransaction};
pub use query::{OrderFilter, Page, PageResult};
pub use shard::ShardRouter;
pub use store::{OrderStore, OrderStoreExt, OrderTransaction, TxFuture};
