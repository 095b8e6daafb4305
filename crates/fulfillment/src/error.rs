//! Fulfillment error types.

use common::IdError;
use domain::OrderError;
use order_store::StoreError;
use thiserror::Error;

/// Errors returned by checkout and order commands.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// The checkout request was rejected before anything was written.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The stock pre-lock found fewer units than requested.
    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },

    #[error("Rejected by risk control ({code}): {reason}")]
    RiskRejected { code: String, reason: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Id generation error: {0}")]
    Id(#[from] IdError),

    /// A collaborator call failed or could not be reached.
    #[error("{service} service error: {message}")]
    Service {
        service: &'static str,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used for logging and for the caller's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing was written.
    Validation,
    /// Rejected by the risk gate.
    Security,
    NotFound,
    /// The order refused the command; it is unchanged.
    Invariant,
    /// Store, id generator or collaborator failure. Safe to retry.
    Infrastructure,
}

impl FulfillmentError {
    pub fn service(service: &'static str, message: impl Into<String>) -> Self {
        Self::Service {
            service,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InsufficientStock { .. } => ErrorKind::Validation,
            Self::RiskRejected { .. } => ErrorKind::Security,
            Self::OrderNotFound(_) => ErrorKind::NotFound,
            Self::Order(err) => match err {
                OrderError::InvalidStateTransition { .. }
                | OrderError::DiscountExceedsTotal { .. } => ErrorKind::Invariant,
                OrderError::CorruptRecord(_) => ErrorKind::Infrastructure,
                _ => ErrorKind::Validation,
            },
            Self::Store(_) | Self::Id(_) | Self::Service { .. } | Self::Serialization(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// True when the order refused a transition from its current status.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::Order(OrderError::InvalidStateTransition { .. })
        )
    }
}

/// Convenience type alias for fulfillment results.
pub type Result<T> = std::result::Result<T, FulfillmentError>;
