//! Flat persistence form of an order.

use common::{CustomerId, OrderId, OrderNo};
use serde::{Deserialize, Serialize};

use super::aggregate::{OrderTimestamps, actual_amount};
use super::{
    Money, Order, OrderError, OrderItem, OrderLog, OrderStatus, PaymentMethod, ShippingAddress,
};

/// Storage representation of an [`Order`].
///
/// Stores write this shape and hand it back to [`Order::from_record`], which
/// re-checks the amount and log invariants before the aggregate is usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub order_no: OrderNo,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub actual_amount: Money,
    pub shipping_fee: Money,
    pub discount_amount: Money,
    pub coupon_code: Option<String>,
    pub idempotency_key: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_ref: Option<String>,
    pub tracking_no: Option<String>,
    pub cancel_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub remark: Option<String>,
    pub shipping_address: ShippingAddress,
    pub items: Vec<OrderItem>,
    pub logs: Vec<OrderLog>,
    pub timestamps: OrderTimestamps,
}

impl Order {
    pub fn to_record(&self) -> OrderRecord {
        OrderRecord {
            id: self.id,
            order_no: self.order_no.clone(),
            customer_id: self.customer_id,
            status: self.status,
            total_amount: self.total_amount,
            actual_amount: self.actual_amount,
            shipping_fee: self.shipping_fee,
            discount_amount: self.discount_amount,
            coupon_code: self.coupon_code.clone(),
            idempotency_key: self.idempotency_key.clone(),
            payment_method: self.payment_method,
            payment_ref: self.payment_ref.clone(),
            tracking_no: self.tracking_no.clone(),
            cancel_reason: self.cancel_reason.clone(),
            refund_reason: self.refund_reason.clone(),
            remark: self.remark.clone(),
            shipping_address: self.shipping_address.clone(),
            items: self.items.clone(),
            logs: self.logs.clone(),
            timestamps: self.timestamps.clone(),
        }
    }

    pub fn from_record(record: OrderRecord) -> Result<Self, OrderError> {
        if record.items.is_empty() {
            return Err(OrderError::CorruptRecord(format!(
                "order {} has no items",
                record.order_no
            )));
        }

        let total = record
            .items
            .iter()
            .try_fold(Money::zero(), |acc, item| {
                item.line_total().and_then(|line| acc.checked_add(line))
            })
            .ok_or(OrderError::AmountOverflow)?;
        if total != record.total_amount {
            return Err(OrderError::CorruptRecord(format!(
                "order {} total {} does not match items {}",
                record.order_no, record.total_amount, total
            )));
        }
        if actual_amount(total, record.discount_amount)? != record.actual_amount {
            return Err(OrderError::CorruptRecord(format!(
                "order {} actual amount {} does not match discount",
                record.order_no, record.actual_amount
            )));
        }

        match record.logs.last() {
            Some(log) if log.new_status == record.status => {}
            _ => {
                return Err(OrderError::CorruptRecord(format!(
                    "order {} log does not end in {}",
                    record.order_no, record.status
                )));
            }
        }

        Ok(Self {
            id: record.id,
            order_no: record.order_no,
            customer_id: record.customer_id,
            status: record.status,
            total_amount: record.total_amount,
            actual_amount: record.actual_amount,
            shipping_fee: record.shipping_fee,
            discount_amount: record.discount_amount,
            coupon_code: record.coupon_code,
            idempotency_key: record.idempotency_key,
            payment_method: record.payment_method,
            payment_ref: record.payment_ref,
            tracking_no: record.tracking_no,
            cancel_reason: record.cancel_reason,
            refund_reason: record.refund_reason,
            remark: record.remark,
            shipping_address: record.shipping_address,
            items: record.items,
            logs: record.logs,
            timestamps: record.timestamps,
        })
    }
}
