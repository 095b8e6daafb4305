//! Identifier types shared across the order platform.
//!
//! Order identifiers embed the index of the shard that owns them, so any
//! component holding an `OrderId` or `OrderNo` can route to the right
//! partition without knowing the customer.

pub mod error;
pub mod id_gen;
pub mod types;

pub use error::IdError;
pub use id_gen::{EPOCH_MS, IdGenerator, MAX_SHARDS, MAX_WORKERS, timestamp_of};
pub use types::{CustomerId, OrderId, OrderNo, ShardId};
