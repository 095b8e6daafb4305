//! Coupon service contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CustomerId, OrderId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponOutcome {
    Used,
    Invalid,
    AlreadyUsed,
}

/// Payload of a redeem or release call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRedemption {
    pub customer_id: CustomerId,
    pub coupon_code: String,
    pub order_id: OrderId,
}

#[async_trait]
pub trait CouponService: Send + Sync {
    /// Redeems a coupon for an order. Redeeming it again for the same order
    /// reports `Used`.
    async fn use_coupon(
        &self,
        redemption: &CouponRedemption,
        idempotency_key: &str,
    ) -> Result<CouponOutcome>;

    /// Returns a coupon redeemed for `redemption.order_id`. Idempotent.
    async fn release_coupon(&self, redemption: &CouponRedemption, idempotency_key: &str)
    -> Result<()>;
}

#[derive(Debug)]
struct Coupon {
    owner: CustomerId,
    used_by: Option<OrderId>,
}

#[derive(Debug, Default)]
struct CouponState {
    coupons: HashMap<String, Coupon>,
    unavailable: bool,
}

/// In-memory coupon service for tests and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCouponService {
    state: Arc<Mutex<CouponState>>,
}

impl InMemoryCouponService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues an unused coupon to `owner`.
    pub fn issue(&self, code: impl Into<String>, owner: CustomerId) {
        self.state.lock().coupons.insert(
            code.into(),
            Coupon {
                owner,
                used_by: None,
            },
        );
    }

    /// The order a coupon is currently redeemed for.
    pub fn used_by(&self, code: &str) -> Option<OrderId> {
        self.state.lock().coupons.get(code).and_then(|c| c.used_by)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl CouponService for InMemoryCouponService {
    async fn use_coupon(
        &self,
        redemption: &CouponRedemption,
        idempotency_key: &str,
    ) -> Result<CouponOutcome> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(FulfillmentError::service("coupon", "connection refused"));
        }

        let Some(coupon) = state.coupons.get_mut(&redemption.coupon_code) else {
            return Ok(CouponOutcome::Invalid);
        };
        if coupon.owner != redemption.customer_id {
            return Ok(CouponOutcome::Invalid);
        }
        match coupon.used_by {
            Some(order_id) if order_id == redemption.order_id => Ok(CouponOutcome::Used),
            Some(_) => Ok(CouponOutcome::AlreadyUsed),
            None => {
                coupon.used_by = Some(redemption.order_id);
                tracing::debug!(code = %redemption.coupon_code, idempotency_key, "coupon used");
                Ok(CouponOutcome::Used)
            }
        }
    }

    async fn release_coupon(
        &self,
        redemption: &CouponRedemption,
        _idempotency_key: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(FulfillmentError::service("coupon", "connection refused"));
        }
        if let Some(coupon) = state.coupons.get_mut(&redemption.coupon_code) {
            if coupon.used_by == Some(redemption.order_id) {
                coupon.used_by = None;
            }
        }
        Ok(())
    }
}
