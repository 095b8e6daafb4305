//! Checkout orchestration for the order platform.
//!
//! This crate provides:
//! - [`SagaCoordinator`]: risk gate, stock pre-lock, transactional order
//!   creation with its outbox events, saga submission and the saga callbacks
//! - [`OrderService`]: state-machine commands as shard-local read-modify-writes
//! - [`PaymentTimeouts`]: payment deadlines on the timeout wheel, with rehydration
//! - Collaborator contracts in [`services`] with in-memory implementations

pub mod error;
pub mod orders;
pub mod saga;
pub mod services;
pub mod timeouts;

pub use error::{ErrorKind, FulfillmentError, Result};
pub use orders::{Execution, OrderService, PAYMENT_TIMEOUT_REASON, SYSTEM_OPERATOR};
pub use saga::{
    CallbackOutcome, Collaborators, CreateOrderRequest, SagaCoordinator, SagaDefinition,
    SagaExecutor, SagaOutcome, SagaStep, SagaWorker,
};
pub use timeouts::PaymentTimeouts;
