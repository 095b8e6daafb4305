//! Stock service contract and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use domain::SkuId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

const SERVICE: &str = "stock";

/// Answer to a synchronous stock pre-lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    Insufficient { available: u32 },
}

/// Payload of a deduct or revert call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub order_id: OrderId,
    pub sku_id: SkuId,
    pub quantity: u32,
    pub warehouse: String,
}

#[async_trait]
pub trait StockService: Send + Sync {
    /// Holds `quantity` units so the saga's deduction cannot fail on availability.
    async fn lock_stock(&self, sku: &SkuId, quantity: u32, reason: &str) -> Result<LockOutcome>;

    /// Returns held units to the sellable pool. Releasing more than is held
    /// releases what is held.
    async fn release_stock(&self, sku: &SkuId, quantity: u32) -> Result<()>;

    /// Consumes held units. Repeating a call with the same key has no effect.
    async fn deduct_stock(&self, movement: &StockMovement, idempotency_key: &str) -> Result<()>;

    /// Undoes the deduction made under `idempotency_key`, if any. Idempotent.
    async fn revert_stock(&self, movement: &StockMovement, idempotency_key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct StockState {
    available: HashMap<SkuId, u32>,
    locked: HashMap<SkuId, u32>,
    deducted: HashMap<String, StockMovement>,
    reverted: HashSet<String>,
    deduct_calls: usize,
    fail_deduct: HashSet<SkuId>,
    unavailable: bool,
}

/// In-memory stock service for tests and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockService {
    state: Arc<Mutex<StockState>>,
}

impl InMemoryStockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sellable quantity of a SKU.
    pub fn set_stock(&self, sku: impl Into<SkuId>, quantity: u32) {
        self.state.lock().available.insert(sku.into(), quantity);
    }

    pub fn with_stock(self, sku: impl Into<SkuId>, quantity: u32) -> Self {
        self.set_stock(sku, quantity);
        self
    }

    pub fn available(&self, sku: &SkuId) -> u32 {
        self.state.lock().available.get(sku).copied().unwrap_or(0)
    }

    pub fn locked(&self, sku: &SkuId) -> u32 {
        self.state.lock().locked.get(sku).copied().unwrap_or(0)
    }

    /// Deductions currently in effect.
    pub fn deduction_count(&self) -> usize {
        self.state.lock().deducted.len()
    }

    /// Every deduct call received, duplicates included.
    pub fn deduct_calls(&self) -> usize {
        self.state.lock().deduct_calls
    }

    /// Makes deductions of `sku` fail.
    pub fn fail_deduct_for(&self, sku: impl Into<SkuId>) {
        self.state.lock().fail_deduct.insert(sku.into());
    }

    /// Makes every call fail as if the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl StockService for InMemoryStockService {
    async fn lock_stock(&self, sku: &SkuId, quantity: u32, reason: &str) -> Result<LockOutcome> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(FulfillmentError::service(SERVICE, "connection refused"));
        }

        let available = state.available.get(sku).copied().unwrap_or(0);
        if available < quantity {
            return Ok(LockOutcome::Insufficient { available });
        }
        state.available.insert(sku.clone(), available - quantity);
        *state.locked.entry(sku.clone()).or_default() += quantity;
        tracing::debug!(%sku, quantity, reason, "stock locked");
        Ok(LockOutcome::Locked)
    }

    async fn release_stock(&self, sku: &SkuId, quantity: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(FulfillmentError::service(SERVICE, "connection refused"));
        }

        let locked = state.locked.entry(sku.clone()).or_default();
        let released = quantity.min(*locked);
        *locked -= released;
        *state.available.entry(sku.clone()).or_default() += released;
        tracing::debug!(%sku, released, "stock released");
        Ok(())
    }

    async fn deduct_stock(&self, movement: &StockMovement, idempotency_key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.deduct_calls += 1;
        if state.unavailable {
            return Err(FulfillmentError::service(SERVICE, "connection refused"));
        }
        if state.deducted.contains_key(idempotency_key) {
            return Ok(());
        }
        if state.fail_deduct.contains(&movement.sku_id) {
            return Err(FulfillmentError::service(
                SERVICE,
                format!("deduction of {} rejected", movement.sku_id),
            ));
        }

        let locked = state.locked.entry(movement.sku_id.clone()).or_default();
        *locked = locked.saturating_sub(movement.quantity);
        state
            .deducted
            .insert(idempotency_key.to_string(), movement.clone());
        Ok(())
    }

    async fn revert_stock(&self, movement: &StockMovement, idempotency_key: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(FulfillmentError::service(SERVICE, "connection refused"));
        }
        if !state.reverted.insert(idempotency_key.to_string()) {
            return Ok(());
        }
        // Reverting a deduction that never happened is recorded and ignored.
        if let Some(deducted) = state.deducted.remove(idempotency_key) {
            *state.available.entry(deducted.sku_id).or_default() += deducted.quantity;
        } else {
            tracing::debug!(sku = %movement.sku_id, idempotency_key, "nothing to revert");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movement(sku: &str, quantity: u32) -> StockMovement {
        StockMovement {
            order_id: OrderId::from_raw(1),
            sku_id: SkuId::new(sku),
            quantity,
            warehouse: "WH-1".to_string(),
        }
    }

    #[tokio::test]
    async fn lock_moves_units_from_available_to_locked() {
        let stock = InMemoryStockService::new().with_stock("SKU-1", 5);
        let sku = SkuId::new("SKU-1");

        let outcome = stock.lock_stock(&sku, 3, "checkout").await.unwrap();
        assert_eq!(outcome, LockOutcome::Locked);
        assert_eq!(stock.available(&sku), 2);
        assert_eq!(stock.locked(&sku), 3);

        let outcome = stock.lock_stock(&sku, 3, "checkout").await.unwrap();
        assert_eq!(outcome, LockOutcome::Insufficient { available: 2 });
    }

    #[tokio::test]
    async fn release_returns_held_units_only() {
        let stock = InMemoryStockService::new().with_stock("SKU-1", 5);
        let sku = SkuId::new("SKU-1");
        stock.lock_stock(&sku, 3, "checkout").await.unwrap();

        stock.release_stock(&sku, 2).await.unwrap();
        assert_eq!(stock.locked(&sku), 1);
        assert_eq!(stock.available(&sku), 4);

        stock.release_stock(&sku, 10).await.unwrap();
        assert_eq!(stock.locked(&sku), 0);
        assert_eq!(stock.available(&sku), 5);
    }

    #[tokio::test]
    async fn deduct_is_idempotent_per_key() {
        let stock = InMemoryStockService::new().with_stock("SKU-1", 5);
        let sku = SkuId::new("SKU-1");
        stock.lock_stock(&sku, 2, "checkout").await.unwrap();

        stock.deduct_stock(&movement("SKU-1", 2), "A:0").await.unwrap();
        stock.deduct_stock(&movement("SKU-1", 2), "A:0").await.unwrap();

        assert_eq!(stock.deduct_calls(), 2);
        assert_eq!(stock.deduction_count(), 1);
        assert_eq!(stock.locked(&sku), 0);
    }

    #[tokio::test]
    async fn revert_returns_units_once() {
        let stock = InMemoryStockService::new().with_stock("SKU-1", 5);
        let sku = SkuId::new("SKU-1");
        stock.lock_stock(&sku, 2, "checkout").await.unwrap();
        stock.deduct_stock(&movement("SKU-1", 2), "A:0").await.unwrap();

        stock.revert_stock(&movement("SKU-1", 2), "A:0").await.unwrap();
        stock.revert_stock(&movement("SKU-1", 2), "A:0").await.unwrap();

        assert_eq!(stock.available(&sku), 5);
        assert_eq!(stock.deduction_count(), 0);
    }

    #[tokio::test]
    async fn revert_without_deduction_is_a_no_op() {
        let stock = InMemoryStockService::new().with_stock("SKU-1", 5);
        stock.revert_stock(&movement("SKU-1", 2), "A:0").await.unwrap();
        assert_eq!(stock.available(&SkuId::new("SKU-1")), 5);
    }

    #[tokio::test]
    async fn unavailable_service_errors() {
        let stock = InMemoryStockService::new().with_stock("SKU-1", 5);
        stock.set_unavailable(true);
        let result = stock.lock_stock(&SkuId::new("SKU-1"), 1, "checkout").await;
        assert!(matches!(result, Err(FulfillmentError::Service { .. })));
    }
}
