//! Two-tier admission middleware.
//!
//! Order of evaluation for every request:
//!
//! 1. Global adaptive admission. Rejection here is immediate and skips the
//!    per-operation tier entirely.
//! 2. Registry lookup for the request's operation. A missing entry is a
//!    deployment defect and fails closed.
//! 3. Token bucket acquisition, waiting at most the operation's wait timeout.
//! 4. The next pipeline stage.
//!
//! The global admission token is settled on every exit path, including a
//! panicking downstream stage and a dropped request future.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tonic::{Code, Status};
use tracing::{debug, error, trace};

use super::error::AdmissionError;
use super::handler::{Handler, RequestContext};
use crate::adaptive::{AdaptiveAdmissionController, AdmissionToken, Outcome};
use crate::ratelimit::{AcquireError, LimiterRegistry};

/// What the global tier is told when the per-operation tier rejects a
/// request it had already admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Count the rejection as a failed request, tightening future admission
    ReportFailure,
    /// Release the in-flight slot without touching the statistics
    #[default]
    Exclude,
}

/// Composes the global controller and the per-operation registry around the
/// next pipeline stage.
pub struct AdmissionMiddleware<H> {
    controller: Option<Arc<AdaptiveAdmissionController>>,
    registry: Arc<LimiterRegistry>,
    policy: RejectionPolicy,
    next: H,
}

impl<H: Handler> AdmissionMiddleware<H> {
    /// Create a middleware. Passing `None` for the controller disables the
    /// global tier.
    pub fn new(
        controller: Option<Arc<AdaptiveAdmissionController>>,
        registry: Arc<LimiterRegistry>,
        next: H,
    ) -> Self {
        Self {
            controller,
            registry,
            policy: RejectionPolicy::default(),
            next,
        }
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn controller(&self) -> Option<&Arc<AdaptiveAdmissionController>> {
        self.controller.as_ref()
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    pub fn rejection_policy(&self) -> RejectionPolicy {
        self.policy
    }

    /// Run a request through both tiers and, if admitted, the next stage.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: H::Request,
    ) -> Result<H::Response, Status> {
        let operation = ctx.operation();

        let token = match &self.controller {
            Some(controller) => match controller.admit() {
                Ok(token) => Some(token),
                Err(overloaded) => {
                    debug!(
                        operation = %operation,
                        in_flight = overloaded.in_flight,
                        ceiling = overloaded.ceiling,
                        "Request shed by global tier"
                    );
                    return Err(AdmissionError::ServiceOverloaded.into());
                }
            },
            None => None,
        };

        let Some(bucket) = self.registry.resolve(operation) else {
            error!(operation = %operation, "No rate limit configured for operation");
            if let Some(token) = token {
                token.discard();
            }
            return Err(AdmissionError::LimiterMisconfigured {
                operation: operation.to_string(),
            }
            .into());
        };

        if let Err(err) = bucket.acquire(ctx.cancellation()).await {
            return Err(self.settle_rejected(token, operation, err).into());
        }

        trace!(operation = %operation, "Request admitted");

        match AssertUnwindSafe(self.next.call(ctx, request)).catch_unwind().await {
            Ok(result) => {
                if let Some(token) = token {
                    token.complete(outcome_of(&result));
                }
                result
            }
            Err(panic) => {
                error!(operation = %operation, "Downstream handler panicked");
                if let Some(token) = token {
                    token.complete(Outcome::Failure);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn settle_rejected(
        &self,
        token: Option<AdmissionToken>,
        operation: &str,
        err: AcquireError,
    ) -> AdmissionError {
        match err {
            AcquireError::LimitExceeded => {
                debug!(operation = %operation, policy = ?self.policy, "Request rate limited");
                if let Some(token) = token {
                    match self.policy {
                        RejectionPolicy::ReportFailure => token.complete(Outcome::Failure),
                        RejectionPolicy::Exclude => token.discard(),
                    }
                }
                AdmissionError::RateLimitExceeded {
                    operation: operation.to_string(),
                }
            }
            AcquireError::Canceled => {
                debug!(operation = %operation, "Request canceled while waiting for a permit");
                if let Some(token) = token {
                    token.complete(Outcome::Canceled);
                }
                AdmissionError::Canceled {
                    operation: operation.to_string(),
                }
            }
        }
    }
}

fn outcome_of<T>(result: &Result<T, Status>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(status) if status.code() == Code::Cancelled => Outcome::Canceled,
        Err(_) => Outcome::Failure,
    }
}

#[async_trait]
impl<H: Handler> Handler for AdmissionMiddleware<H> {
    type Request = H::Request;
    type Response = H::Response;

    async fn call(
        &self,
        ctx: &RequestContext,
        request: Self::Request,
    ) -> Result<Self::Response, Status> {
        self.handle(ctx, request).await
    }
}
