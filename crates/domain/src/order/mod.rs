//! Order aggregate and related types.

mod aggregate;
mod events;
mod record;
mod state;
mod value_objects;

pub use aggregate::{NewOrder, Order, OrderTimestamps};
pub use events::{
    EventItem, ORDER_CREATED_TOPIC, OrderCreatedEvent, PAYMENT_TIMEOUT_TOPIC, PaymentTimeoutEvent,
};
pub use record::OrderRecord;
pub use state::{OrderAction, OrderStatus, ParseEnumError};
pub use value_objects::{
    Money, OrderItem, OrderLog, PaymentMethod, ProductId, ShippingAddress, SkuId,
};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// The transition table has no edge for this action.
    #[error("invalid state transition: cannot {action} from {current}")]
    InvalidStateTransition {
        current: OrderStatus,
        action: OrderAction,
    },

    #[error("order has no items")]
    NoItems,

    #[error("invalid quantity {quantity} for {sku} (must be greater than 0)")]
    InvalidQuantity { sku: String, quantity: u32 },

    #[error("invalid price {price} for {sku} (must be greater than 0)")]
    InvalidPrice { sku: String, price: i64 },

    #[error("{field} must not be negative, got {amount}")]
    NegativeAmount { field: &'static str, amount: i64 },

    #[error("discount {discount} exceeds order total {total}")]
    DiscountExceedsTotal { discount: Money, total: Money },

    #[error("order amount overflow")]
    AmountOverflow,

    #[error("shipping address is incomplete")]
    UndeliverableAddress,

    /// A stored order failed its invariant checks on load.
    #[error("corrupt order record: {0}")]
    CorruptRecord(String),
}
