//! Order domain model.
//!
//! This crate provides:
//! - The order aggregate and its transition table
//! - Value objects for money, items, addresses and the audit log
//! - Integration events written to the outbox

pub mod event;
pub mod order;

pub use event::DomainEvent;
pub use order::{
    EventItem, Money, NewOrder, ORDER_CREATED_TOPIC, Order, OrderAction, OrderCreatedEvent, OrderError,
    OrderItem, OrderLog, OrderRecord, OrderStatus, OrderTimestamps, PAYMENT_TIMEOUT_TOPIC,
    ParseEnumError, PaymentMethod, PaymentTimeoutEvent, ProductId, ShippingAddress, SkuId,
};
