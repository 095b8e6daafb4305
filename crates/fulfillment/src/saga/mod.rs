//! Allocation saga for new orders.
//!
//! Each line item contributes a deduct/revert step pair; a coupon adds a
//! redeem/release pair at the end. The step list is built once, submitted to
//! the saga log and never held in process afterwards: progress comes back
//! through the coordinator's callbacks, keyed by order number.

pub mod coordinator;
pub mod definition;
pub mod executor;
pub mod worker;

pub use coordinator::{CallbackOutcome, Collaborators, CreateOrderRequest, SagaCoordinator};
pub use definition::{
    COUPON_RELEASE, COUPON_USE, STOCK_DEDUCT, STOCK_REVERT, SagaDefinition, SagaStep, step_key,
};
pub use executor::{SagaExecutor, SagaOutcome};
pub use worker::SagaWorker;
