//! In-process execution of a saga step list.

use std::sync::Arc;

use crate::error::{FulfillmentError, Result};
use crate::services::{
    CouponOutcome, CouponRedemption, CouponService, StockMovement, StockService,
};

use super::definition::{
    COUPON_RELEASE, COUPON_USE, STOCK_DEDUCT, STOCK_REVERT, SagaDefinition, SagaStep,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Every forward step succeeded.
    Completed,
    /// Step `failed_step` failed and the steps before it were undone.
    Compensated {
        failed_step: usize,
        reason: String,
        /// Steps whose compensation also failed.
        compensation_failures: Vec<usize>,
    },
}

/// Runs forward steps in order and, on the first failure, compensates the
/// completed ones in reverse.
///
/// Every call carries the step's idempotency key, so re-running a saga that
/// was interrupted half way has no additional effect on the services.
#[derive(Clone)]
pub struct SagaExecutor {
    stock: Arc<dyn StockService>,
    coupons: Arc<dyn CouponService>,
}

impl SagaExecutor {
    pub fn new(stock: Arc<dyn StockService>, coupons: Arc<dyn CouponService>) -> Self {
        Self { stock, coupons }
    }

    #[tracing::instrument(skip(self, saga), fields(order_no = %saga.order_no, steps = saga.len()))]
    pub async fn execute(&self, saga: &SagaDefinition) -> SagaOutcome {
        let mut completed: Vec<&SagaStep> = Vec::with_capacity(saga.len());

        for step in &saga.steps {
            tracing::debug!(step = step.index, endpoint = %step.forward, "saga step started");
            if let Err(err) = self.run_forward(step).await {
                tracing::warn!(step = step.index, error = %err, "saga step failed");
                metrics::counter!("saga_step_failed_total", "endpoint" => step.forward.clone())
                    .increment(1);
                let compensation_failures = self.compensate(&completed).await;
                return SagaOutcome::Compensated {
                    failed_step: step.index,
                    reason: err.to_string(),
                    compensation_failures,
                };
            }
            completed.push(step);
        }

        SagaOutcome::Completed
    }

    /// Undoes every step of `saga` in reverse, whether it ran or not.
    ///
    /// Returns the steps whose compensation failed.
    pub async fn compensate_all(&self, saga: &SagaDefinition) -> Vec<usize> {
        let steps: Vec<&SagaStep> = saga.steps.iter().collect();
        self.compensate(&steps).await
    }

    async fn compensate(&self, completed: &[&SagaStep]) -> Vec<usize> {
        let mut failures = Vec::new();
        for step in completed.iter().rev() {
            match self.run_compensation(step).await {
                Ok(()) => {
                    tracing::debug!(step = step.index, endpoint = %step.compensation, "step compensated");
                }
                Err(err) => {
                    tracing::error!(
                        step = step.index,
                        endpoint = %step.compensation,
                        error = %err,
                        "compensation failed"
                    );
                    failures.push(step.index);
                }
            }
        }
        failures
    }

    async fn run_forward(&self, step: &SagaStep) -> Result<()> {
        match step.forward.as_str() {
            STOCK_DEDUCT => {
                let movement: StockMovement = serde_json::from_value(step.payload.clone())?;
                self.stock
                    .deduct_stock(&movement, &step.idempotency_key)
                    .await
            }
            COUPON_USE => {
                let redemption: CouponRedemption = serde_json::from_value(step.payload.clone())?;
                match self
                    .coupons
                    .use_coupon(&redemption, &step.idempotency_key)
                    .await?
                {
                    CouponOutcome::Used => Ok(()),
                    CouponOutcome::Invalid => Err(FulfillmentError::service(
                        "coupon",
                        format!("coupon {} is invalid", redemption.coupon_code),
                    )),
                    CouponOutcome::AlreadyUsed => Err(FulfillmentError::service(
                        "coupon",
                        format!("coupon {} is already used", redemption.coupon_code),
                    )),
                }
            }
            other => Err(FulfillmentError::Validation(format!(
                "unknown saga endpoint {other}"
            ))),
        }
    }

    async fn run_compensation(&self, step: &SagaStep) -> Result<()> {
        match step.compensation.as_str() {
            STOCK_REVERT => {
                let movement: StockMovement = serde_json::from_value(step.payload.clone())?;
                self.stock
                    .revert_stock(&movement, &step.idempotency_key)
                    .await
            }
            COUPON_RELEASE => {
                let redemption: CouponRedemption = serde_json::from_value(step.payload.clone())?;
                self.coupons
                    .release_coupon(&redemption, &step.idempotency_key)
                    .await
            }
            other => Err(FulfillmentError::Validation(format!(
                "unknown saga endpoint {other}"
            ))),
        }
    }
}
