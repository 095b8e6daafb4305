//! Events published about orders.

use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId, OrderNo};
use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;

use super::{Money, Order, OrderItem, OrderStatus};

pub const ORDER_CREATED_TOPIC: &str = "order.created";
pub const PAYMENT_TIMEOUT_TOPIC: &str = "order.payment.timeout";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventItem {
    pub product_id: String,
    pub sku_id: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl From<&OrderItem> for EventItem {
    fn from(item: &OrderItem) -> Self {
        Self {
            product_id: item.product_id.to_string(),
            sku_id: item.sku_id.to_string(),
            quantity: item.quantity,
            unit_price: item.unit_price,
        }
    }
}

/// Published once per order, in the same transaction that inserts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: OrderId,
    pub order_no: OrderNo,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub actual_amount: Money,
    pub shipping_fee: Money,
    pub coupon_code: Option<String>,
    pub items: Vec<EventItem>,
    pub created_at: DateTime<Utc>,
}

impl OrderCreatedEvent {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            order_no: order.order_no().clone(),
            customer_id: order.customer_id(),
            status: order.status(),
            total_amount: order.total_amount(),
            actual_amount: order.actual_amount(),
            shipping_fee: order.shipping_fee(),
            coupon_code: order.coupon_code().map(str::to_string),
            items: order
                .items()
                .iter()
                .map(EventItem::from)
                .collect(),
            created_at: order.created_at(),
        }
    }
}

impl DomainEvent for OrderCreatedEvent {
    fn topic(&self) -> &'static str {
        ORDER_CREATED_TOPIC
    }

    fn dedup_key(&self) -> String {
        self.order_no.to_string()
    }
}

/// Announces the payment deadline of a new order.
///
/// Written at creation time. Stock and coupon owners use `items` to release
/// their holds if the order is still unpaid at `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTimeoutEvent {
    pub order_id: OrderId,
    pub order_no: OrderNo,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub items: Vec<EventItem>,
    pub expires_at: DateTime<Utc>,
}

impl PaymentTimeoutEvent {
    pub fn from_order(order: &Order, expires_at: DateTime<Utc>) -> Self {
        Self {
            order_id: order.id(),
            order_no: order.order_no().clone(),
            customer_id: order.customer_id(),
            amount: order.actual_amount(),
            items: order.items().iter().map(EventItem::from).collect(),
            expires_at,
        }
    }
}

impl DomainEvent for PaymentTimeoutEvent {
    fn topic(&self) -> &'static str {
        PAYMENT_TIMEOUT_TOPIC
    }

    fn dedup_key(&self) -> String {
        self.order_no.to_string()
    }
}
