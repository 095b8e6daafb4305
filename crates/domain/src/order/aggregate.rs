//! Order aggregate root.

use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId, OrderNo};
use serde::{Deserialize, Serialize};

use super::{
    Money, OrderAction, OrderError, OrderItem, OrderLog, OrderStatus, PaymentMethod,
    ShippingAddress,
};

/// Everything needed to place an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: OrderId,
    pub order_no: OrderNo,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,
    pub shipping_fee: Money,
    pub discount_amount: Money,
    pub coupon_code: Option<String>,
    pub idempotency_key: Option<String>,
    pub remark: Option<String>,
}

/// Per-transition timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTimestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refund_requested_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl OrderTimestamps {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            created_at: at,
            updated_at: at,
            allocated_at: None,
            confirmed_at: None,
            paid_at: None,
            shipped_at: None,
            delivered_at: None,
            completed_at: None,
            cancelled_at: None,
            refund_requested_at: None,
            refunded_at: None,
            closed_at: None,
        }
    }
}

/// Order aggregate root.
///
/// The status only changes through the transition methods below. Each of them
/// checks the transition table first and appends exactly one [`OrderLog`]
/// entry on success; on failure nothing is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub(super) id: OrderId,
    pub(super) order_no: OrderNo,
    pub(super) customer_id: CustomerId,
    pub(super) status: OrderStatus,
    pub(super) total_amount: Money,
    pub(super) actual_amount: Money,
    pub(super) shipping_fee: Money,
    pub(super) discount_amount: Money,
    pub(super) coupon_code: Option<String>,
    pub(super) idempotency_key: Option<String>,
    pub(super) payment_method: Option<PaymentMethod>,
    pub(super) payment_ref: Option<String>,
    pub(super) tracking_no: Option<String>,
    pub(super) cancel_reason: Option<String>,
    pub(super) refund_reason: Option<String>,
    pub(super) remark: Option<String>,
    pub(super) shipping_address: ShippingAddress,
    pub(super) items: Vec<OrderItem>,
    pub(super) logs: Vec<OrderLog>,
    pub(super) timestamps: OrderTimestamps,
}

// Query methods
impl Order {
    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn order_no(&self) -> &OrderNo {
        &self.order_no
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Σ(unit price × quantity) over all items.
    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    /// `total_amount − discount_amount`.
    pub fn actual_amount(&self) -> Money {
        self.actual_amount
    }

    pub fn shipping_fee(&self) -> Money {
        self.shipping_fee
    }

    pub fn discount_amount(&self) -> Money {
        self.discount_amount
    }

    pub fn coupon_code(&self) -> Option<&str> {
        self.coupon_code.as_deref()
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method
    }

    pub fn payment_ref(&self) -> Option<&str> {
        self.payment_ref.as_deref()
    }

    pub fn tracking_no(&self) -> Option<&str> {
        self.tracking_no.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn refund_reason(&self) -> Option<&str> {
        self.refund_reason.as_deref()
    }

    pub fn remark(&self) -> Option<&str> {
        self.remark.as_deref()
    }

    pub fn shipping_address(&self) -> &ShippingAddress {
        &self.shipping_address
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn logs(&self) -> &[OrderLog] {
        &self.logs
    }

    pub fn last_log(&self) -> Option<&OrderLog> {
        self.logs.last()
    }

    pub fn timestamps(&self) -> &OrderTimestamps {
        &self.timestamps
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.timestamps.created_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn awaits_payment(&self) -> bool {
        self.status.awaits_payment()
    }
}

// Construction
impl Order {
    /// Validates the checkout input and builds an order in `PendingPayment`.
    pub fn create(new: NewOrder, operator: &str) -> Result<Self, OrderError> {
        if new.items.is_empty() {
            return Err(OrderError::NoItems);
        }

        let mut total = Money::zero();
        for item in &new.items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    sku: item.sku_id.to_string(),
                    quantity: item.quantity,
                });
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    sku: item.sku_id.to_string(),
                    price: item.unit_price.minor_units(),
                });
            }
            total = item
                .line_total()
                .and_then(|line| total.checked_add(line))
                .ok_or(OrderError::AmountOverflow)?;
        }

        if new.shipping_fee.is_negative() {
            return Err(OrderError::NegativeAmount {
                field: "shipping_fee",
                amount: new.shipping_fee.minor_units(),
            });
        }
        let actual = actual_amount(total, new.discount_amount)?;

        if !new.shipping_address.is_deliverable() {
            return Err(OrderError::UndeliverableAddress);
        }

        let now = Utc::now();
        let creation_log = OrderLog {
            operator: operator.to_string(),
            action: OrderAction::Create,
            old_status: None,
            new_status: OrderStatus::PendingPayment,
            remark: "order created".to_string(),
            created_at: now,
        };

        Ok(Self {
            id: new.id,
            order_no: new.order_no,
            customer_id: new.customer_id,
            status: OrderStatus::PendingPayment,
            total_amount: total,
            actual_amount: actual,
            shipping_fee: new.shipping_fee,
            discount_amount: new.discount_amount,
            coupon_code: new.coupon_code,
            idempotency_key: new.idempotency_key,
            payment_method: None,
            payment_ref: None,
            tracking_no: None,
            cancel_reason: None,
            refund_reason: None,
            remark: new.remark,
            shipping_address: new.shipping_address,
            items: new.items,
            logs: vec![creation_log],
            timestamps: OrderTimestamps::new(now),
        })
    }
}

// Transitions
impl Order {
    /// `PendingPayment → Allocating`: stock and coupon steps were handed to the saga log.
    ///
    /// Only a freshly created order is allocated. Once allocation has run, a
    /// second attempt is rejected even though the order is back in
    /// `PendingPayment`.
    pub fn allocate(&mut self, operator: &str) -> Result<(), OrderError> {
        if self.timestamps.allocated_at.is_some() {
            return Err(OrderError::InvalidStateTransition {
                current: self.status,
                action: OrderAction::Allocate,
            });
        }
        let at = self.transition(OrderAction::Allocate, operator, "allocation started")?;
        self.timestamps.allocated_at = Some(at);
        Ok(())
    }

    /// `Allocating → PendingPayment`: every allocation step succeeded.
    pub fn confirm(&mut self, operator: &str) -> Result<(), OrderError> {
        let at = self.transition(OrderAction::Confirm, operator, "allocation confirmed")?;
        self.timestamps.confirmed_at = Some(at);
        Ok(())
    }

    pub fn pay(
        &mut self,
        operator: &str,
        method: PaymentMethod,
        payment_ref: Option<String>,
    ) -> Result<(), OrderError> {
        let remark = match &payment_ref {
            Some(reference) => format!("paid via {method} ({reference})"),
            None => format!("paid via {method}"),
        };
        let at = self.transition(OrderAction::Pay, operator, remark)?;
        self.payment_method = Some(method);
        self.payment_ref = payment_ref;
        self.timestamps.paid_at = Some(at);
        Ok(())
    }

    pub fn ship(&mut self, operator: &str, tracking_no: Option<String>) -> Result<(), OrderError> {
        let remark = match &tracking_no {
            Some(tracking) => format!("shipped, tracking {tracking}"),
            None => "shipped".to_string(),
        };
        let at = self.transition(OrderAction::Ship, operator, remark)?;
        self.tracking_no = tracking_no;
        self.timestamps.shipped_at = Some(at);
        Ok(())
    }

    pub fn deliver(&mut self, operator: &str) -> Result<(), OrderError> {
        let at = self.transition(OrderAction::Deliver, operator, "delivered")?;
        self.timestamps.delivered_at = Some(at);
        Ok(())
    }

    pub fn complete(&mut self, operator: &str) -> Result<(), OrderError> {
        let at = self.transition(OrderAction::Complete, operator, "completed")?;
        self.timestamps.completed_at = Some(at);
        Ok(())
    }

    /// `PendingPayment | Allocating | Paid → Cancelled`.
    pub fn cancel(&mut self, operator: &str, reason: impl Into<String>) -> Result<(), OrderError> {
        let reason = reason.into();
        let at = self.transition(OrderAction::Cancel, operator, reason.clone())?;
        self.cancel_reason = Some(reason);
        self.timestamps.cancelled_at = Some(at);
        Ok(())
    }

    pub fn request_refund(
        &mut self,
        operator: &str,
        reason: impl Into<String>,
    ) -> Result<(), OrderError> {
        let reason = reason.into();
        let at = self.transition(OrderAction::RequestRefund, operator, reason.clone())?;
        self.refund_reason = Some(reason);
        self.timestamps.refund_requested_at = Some(at);
        Ok(())
    }

    pub fn approve_refund(&mut self, operator: &str) -> Result<(), OrderError> {
        let at = self.transition(OrderAction::ApproveRefund, operator, "refund approved")?;
        self.timestamps.refunded_at = Some(at);
        Ok(())
    }

    /// Retires a finished order.
    pub fn close(&mut self, operator: &str) -> Result<(), OrderError> {
        let at = self.transition(OrderAction::Close, operator, "closed")?;
        self.timestamps.closed_at = Some(at);
        Ok(())
    }

    /// Replaces the discount while the order is still unpaid.
    pub fn apply_discount(&mut self, operator: &str, discount: Money) -> Result<(), OrderError> {
        if !self.status.can(OrderAction::ApplyDiscount) {
            return Err(OrderError::InvalidStateTransition {
                current: self.status,
                action: OrderAction::ApplyDiscount,
            });
        }
        let actual = actual_amount(self.total_amount, discount)?;

        let remark = format!("discount {} -> {}", self.discount_amount, discount);
        self.transition(OrderAction::ApplyDiscount, operator, remark)?;
        self.discount_amount = discount;
        self.actual_amount = actual;
        Ok(())
    }

    fn transition(
        &mut self,
        action: OrderAction,
        operator: &str,
        remark: impl Into<String>,
    ) -> Result<DateTime<Utc>, OrderError> {
        let next = self
            .status
            .next(action)
            .ok_or(OrderError::InvalidStateTransition {
                current: self.status,
                action,
            })?;

        let at = Utc::now();
        self.logs.push(OrderLog {
            operator: operator.to_string(),
            action,
            old_status: Some(self.status),
            new_status: next,
            remark: remark.into(),
            created_at: at,
        });
        self.status = next;
        self.timestamps.updated_at = at;
        Ok(at)
    }
}

pub(super) fn actual_amount(total: Money, discount: Money) -> Result<Money, OrderError> {
    if discount.is_negative() {
        return Err(OrderError::NegativeAmount {
            field: "discount_amount",
            amount: discount.minor_units(),
        });
    }
    if discount > total {
        return Err(OrderError::DiscountExceedsTotal { discount, total });
    }
    total.checked_sub(discount).ok_or(OrderError::AmountOverflow)
}
