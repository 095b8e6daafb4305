//! Collaborator contracts and in-memory implementations.
//!
//! The stock, coupon, payment, risk and saga log services are owned by other
//! teams; only their call contracts live here.

pub mod coupon;
pub mod payment;
pub mod risk;
pub mod saga_log;
pub mod stock;
pub mod warehouse;

pub use coupon::{CouponOutcome, CouponRedemption, CouponService, InMemoryCouponService};
pub use payment::{InMemoryPaymentService, PaymentReceipt, PaymentRequest, PaymentService};
pub use risk::{
    ORDER_CREATE_ACTION, RiskAssessment, RiskContext, RiskLevel, RiskService, StaticRiskService,
};
pub use saga_log::{InProcessSagaLog, RecordingSagaLog, SagaLog};
pub use stock::{InMemoryStockService, LockOutcome, StockMovement, StockService};
pub use warehouse::{StaticWarehouseAllocator, WarehouseAllocator};
