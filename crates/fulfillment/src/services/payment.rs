//! Payment service contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CustomerId, OrderId};
use domain::{Money, PaymentMethod};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub method: PaymentMethod,
    pub amount: Money,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub transaction_ref: String,
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Starts a payment. The outcome arrives later as a callback.
    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt>;
}

#[derive(Debug, Default)]
struct PaymentState {
    by_key: HashMap<String, PaymentReceipt>,
    next_id: u32,
    fail_next: bool,
}

/// In-memory payment service for tests and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<Mutex<PaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail.
    pub fn set_fail_next(&self, fail: bool) {
        self.state.lock().fail_next = fail;
    }

    /// Number of distinct payments started.
    pub fn payment_count(&self) -> usize {
        self.state.lock().by_key.len()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn initiate_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(FulfillmentError::service("payment", "gateway timeout"));
        }
        if let Some(receipt) = state.by_key.get(&request.idempotency_key) {
            return Ok(receipt.clone());
        }

        state.next_id += 1;
        let receipt = PaymentReceipt {
            transaction_ref: format!("TXN-{:06}", state.next_id),
        };
        state
            .by_key
            .insert(request.idempotency_key.clone(), receipt.clone());
        Ok(receipt)
    }
}
