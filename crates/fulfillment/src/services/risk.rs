//! Risk service contract.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::CustomerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

/// Action name assessed before an order is created.
pub const ORDER_CREATE_ACTION: &str = "order.create";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Allow,
    /// Suspicious but not blocking.
    Review,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub code: String,
    pub reason: String,
}

impl RiskAssessment {
    pub fn allow() -> Self {
        Self {
            level: RiskLevel::Allow,
            code: "OK".to_string(),
            reason: String::new(),
        }
    }

    pub fn review(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            level: RiskLevel::Review,
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn reject(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            level: RiskLevel::Reject,
            code: code.into(),
            reason: reason.into(),
        }
    }
}

/// Who is acting and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskContext {
    pub customer_id: Option<CustomerId>,
    pub client_ip: Option<String>,
    pub device_id: Option<String>,
}

#[async_trait]
pub trait RiskService: Send + Sync {
    async fn assess(
        &self,
        context: &RiskContext,
        action: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<RiskAssessment>;
}

/// Risk service answering every call with a configured assessment.
///
/// `None` simulates an unreachable service.
#[derive(Debug, Clone)]
pub struct StaticRiskService {
    answer: Arc<Mutex<Option<RiskAssessment>>>,
    calls: Arc<AtomicUsize>,
}

impl StaticRiskService {
    pub fn new(answer: Option<RiskAssessment>) -> Self {
        Self {
            answer: Arc::new(Mutex::new(answer)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(Some(RiskAssessment::allow()))
    }

    pub fn unavailable() -> Self {
        Self::new(None)
    }

    pub fn set_answer(&self, answer: Option<RiskAssessment>) {
        *self.answer.lock() = answer;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StaticRiskService {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[async_trait]
impl RiskService for StaticRiskService {
    async fn assess(
        &self,
        _context: &RiskContext,
        _action: &str,
        _attributes: &BTreeMap<String, String>,
    ) -> Result<RiskAssessment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .ok_or_else(|| FulfillmentError::service("risk", "risk engine unreachable"))
    }
}
