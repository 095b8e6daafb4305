//! Order state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an order.
///
/// ```text
///                ┌────────── Allocate ──────────┐
///                ▼                              │
/// PendingPayment ◄── Confirm ── Allocating ◄────┘
///       │                           │
///       ├── Pay ──► Paid ──► Shipped ──► Delivered ──► Completed ──┐
///       │            │         │            │                       │
///       │            └─────────┴────────────┴──► RefundRequested    │
///       │            │                                 │            │
///       └────────────┴──► Cancelled               Refunded          │
///                             │                        │            │
///                             └────────────────────────┴──► Closed ◄┘
/// ```
/// `Allocating` can also be cancelled directly. `Allocate` is taken once, by
/// checkout, on a freshly created order; [`Order::allocate`](crate::Order::allocate)
/// rejects it after a `Confirm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Created and waiting for the customer to pay.
    #[default]
    PendingPayment,

    /// Stock and coupon steps are in flight on the saga log.
    Allocating,

    Paid,
    Shipped,
    Delivered,
    Completed,
    Cancelled,
    RefundRequested,
    Refunded,

    /// Logically retired; rows are never physically deleted.
    Closed,
}

/// A command that may move an order between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderAction {
    Create,
    Allocate,
    Confirm,
    Pay,
    Ship,
    Deliver,
    Complete,
    Cancel,
    RequestRefund,
    ApproveRefund,
    Close,
    /// Amount change that keeps the current status.
    ApplyDiscount,
}

use OrderAction as A;
use OrderStatus as S;

/// Every legal move as `(source, action, target)`.
const TRANSITIONS: &[(OrderStatus, OrderAction, OrderStatus)] = &[
    (S::PendingPayment, A::Allocate, S::Allocating),
    (S::Allocating, A::Confirm, S::PendingPayment),
    (S::PendingPayment, A::Pay, S::Paid),
    (S::Paid, A::Ship, S::Shipped),
    (S::Shipped, A::Deliver, S::Delivered),
    (S::Delivered, A::Complete, S::Completed),
    (S::PendingPayment, A::Cancel, S::Cancelled),
    (S::Paid, A::Cancel, S::Cancelled),
    (S::Allocating, A::Cancel, S::Cancelled),
    (S::Paid, A::RequestRefund, S::RefundRequested),
    (S::Shipped, A::RequestRefund, S::RefundRequested),
    (S::Delivered, A::RequestRefund, S::RefundRequested),
    (S::RefundRequested, A::ApproveRefund, S::Refunded),
    (S::Completed, A::Close, S::Closed),
    (S::Cancelled, A::Close, S::Closed),
    (S::Refunded, A::Close, S::Closed),
    (S::PendingPayment, A::ApplyDiscount, S::PendingPayment),
    (S::Allocating, A::ApplyDiscount, S::Allocating),
];

impl OrderStatus {
    /// Looks up the target of `action` from this status.
    pub fn next(self, action: OrderAction) -> Option<OrderStatus> {
        TRANSITIONS
            .iter()
            .find(|(from, a, _)| *from == self && *a == action)
            .map(|(_, _, to)| *to)
    }

    pub fn can(self, action: OrderAction) -> bool {
        self.next(action).is_some()
    }

    /// Actions accepted from this status.
    pub fn allowed_actions(self) -> Vec<OrderAction> {
        TRANSITIONS
            .iter()
            .filter(|(from, _, _)| *from == self)
            .map(|(_, action, _)| *action)
            .collect()
    }

    /// True while the payment deadline still applies.
    pub fn awaits_payment(self) -> bool {
        matches!(self, S::PendingPayment | S::Allocating)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, S::Completed | S::Cancelled | S::Refunded | S::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            S::PendingPayment => "PendingPayment",
            S::Allocating => "Allocating",
            S::Paid => "Paid",
            S::Shipped => "Shipped",
            S::Delivered => "Delivered",
            S::Completed => "Completed",
            S::Cancelled => "Cancelled",
            S::RefundRequested => "RefundRequested",
            S::Refunded => "Refunded",
            S::Closed => "Closed",
        }
    }

    pub const ALL: [OrderStatus; 10] = [
        S::PendingPayment,
        S::Allocating,
        S::Paid,
        S::Shipped,
        S::Delivered,
        S::Completed,
        S::Cancelled,
        S::RefundRequested,
        S::Refunded,
        S::Closed,
    ];
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status or action name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        S::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "order status",
                value: s.to_string(),
            })
    }
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            A::Create => "Create",
            A::Allocate => "Allocate",
            A::Confirm => "Confirm",
            A::Pay => "Pay",
            A::Ship => "Ship",
            A::Deliver => "Deliver",
            A::Complete => "Complete",
            A::Cancel => "Cancel",
            A::RequestRefund => "RequestRefund",
            A::ApproveRefund => "ApproveRefund",
            A::Close => "Close",
            A::ApplyDiscount => "ApplyDiscount",
        }
    }

    pub const ALL: [OrderAction; 12] = [
        A::Create,
        A::Allocate,
        A::Confirm,
        A::Pay,
        A::Ship,
        A::Deliver,
        A::Complete,
        A::Cancel,
        A::RequestRefund,
        A::ApproveRefund,
        A::Close,
        A::ApplyDiscount,
    ];
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        A::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "order action",
                value: s.to_string(),
            })
    }
}
