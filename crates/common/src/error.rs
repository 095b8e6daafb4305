use thiserror::Error;

/// Errors raised while generating or parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The order number does not have the `YYYYMMDD-SSS-<id>` shape.
    #[error("Malformed order number: {0}")]
    MalformedOrderNo(String),

    /// The shard segment of an order number differs from the shard in its id.
    #[error("Order number {order_no} names shard {segment} but its id belongs to shard {embedded}")]
    ShardMismatch {
        order_no: String,
        segment: u16,
        embedded: u16,
    },

    /// The shard index does not fit the identifier layout.
    #[error("Shard {shard} out of range (max {max})")]
    ShardOutOfRange { shard: u16, max: u16 },

    /// The worker id does not fit the identifier layout.
    #[error("Worker {worker} out of range (max {max})")]
    WorkerOutOfRange { worker: u16, max: u16 },
}
