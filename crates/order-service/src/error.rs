//! Startup and shutdown errors of the service binary.

use common::IdError;
use fulfillment::FulfillmentError;
use order_store::StoreError;
use thiserror::Error;
use timeout_wheel::WheelError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Timeout wheel error: {0}")]
    Wheel(#[from] WheelError),

    #[error("Id generator error: {0}")]
    Id(#[from] IdError),

    #[error("Fulfillment error: {0}")]
    Fulfillment(#[from] FulfillmentError),

    #[error("Metrics recorder error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
