//! Saga step list.

use common::{CustomerId, OrderId, OrderNo};
use domain::Order;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};
use crate::services::{CouponRedemption, StockMovement};

pub const STOCK_DEDUCT: &str = "stock.deduct";
pub const STOCK_REVERT: &str = "stock.revert";
pub const COUPON_USE: &str = "coupon.use";
pub const COUPON_RELEASE: &str = "coupon.release";

/// Idempotency key of the forward call of step `index`.
pub fn step_key(order_no: &OrderNo, index: usize) -> String {
    format!("{order_no}:{index}")
}

/// A forward call and the call that undoes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub index: usize,
    pub forward: String,
    pub compensation: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub order_no: OrderNo,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub steps: Vec<SagaStep>,
}

impl SagaDefinition {
    pub fn new(order_no: OrderNo, order_id: OrderId, customer_id: CustomerId) -> Self {
        Self {
            order_no,
            order_id,
            customer_id,
            steps: Vec::new(),
        }
    }

    /// Appends a step; its index and key follow from its position.
    pub fn push<P: Serialize>(
        &mut self,
        forward: &str,
        compensation: &str,
        payload: &P,
    ) -> Result<&SagaStep> {
        let index = self.steps.len();
        self.steps.push(SagaStep {
            index,
            forward: forward.to_string(),
            compensation: compensation.to_string(),
            payload: serde_json::to_value(payload)?,
            idempotency_key: step_key(&self.order_no, index),
        });
        Ok(&self.steps[index])
    }

    /// Builds the allocation saga of `order`.
    ///
    /// `warehouses[i]` ships the order's `i`-th item.
    pub fn for_order(order: &Order, warehouses: &[String]) -> Result<Self> {
        if warehouses.len() != order.items().len() {
            return Err(FulfillmentError::Validation(format!(
                "{} warehouses for {} items",
                warehouses.len(),
                order.items().len()
            )));
        }

        let mut saga = Self::new(order.order_no().clone(), order.id(), order.customer_id());
        for (item, warehouse) in order.items().iter().zip(warehouses) {
            let movement = StockMovement {
                order_id: order.id(),
                sku_id: item.sku_id.clone(),
                quantity: item.quantity,
                warehouse: warehouse.clone(),
            };
            saga.push(STOCK_DEDUCT, STOCK_REVERT, &movement)?;
        }
        if let Some(code) = order.coupon_code() {
            let redemption = CouponRedemption {
                customer_id: order.customer_id(),
                coupon_code: code.to_string(),
                order_id: order.id(),
            };
            saga.push(COUPON_USE, COUPON_RELEASE, &redemption)?;
        }
        Ok(saga)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
