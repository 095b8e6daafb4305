//! Warehouse selection for stock deductions.

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{ShippingAddress, SkuId};

use crate::error::Result;

/// Decides which warehouse ships a line item.
#[async_trait]
pub trait WarehouseAllocator: Send + Sync {
    async fn warehouse_for(
        &self,
        sku: &SkuId,
        quantity: u32,
        destination: &ShippingAddress,
    ) -> Result<String>;
}

/// Picks a warehouse by destination province, with a fallback.
#[derive(Debug, Clone)]
pub struct StaticWarehouseAllocator {
    default: String,
    by_province: HashMap<String, String>,
}

impl StaticWarehouseAllocator {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            by_province: HashMap::new(),
        }
    }

    pub fn route(mut self, province: impl Into<String>, warehouse: impl Into<String>) -> Self {
        self.by_province.insert(province.into(), warehouse.into());
        self
    }
}

impl Default for StaticWarehouseAllocator {
    fn default() -> Self {
        Self::new("WH-MAIN")
    }
}

#[async_trait]
impl WarehouseAllocator for StaticWarehouseAllocator {
    async fn warehouse_for(
        &self,
        _sku: &SkuId,
        _quantity: u32,
        destination: &ShippingAddress,
    ) -> Result<String> {
        Ok(self
            .by_province
            .get(&destination.province)
            .unwrap_or(&self.default)
            .clone())
    }
}
