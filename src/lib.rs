//! Floodgate - Two-Tier Request Admission Control
//!
//! This crate sits in front of a service's request handlers and decides
//! whether each incoming call may proceed. A process-wide adaptive controller
//! sheds load when the service as a whole is saturated, and a per-operation
//! token bucket caps the rate of each protocol method independently.

pub mod adaptive;
pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;

pub use adaptive::{AdaptiveAdmissionController, AdmissionToken, Outcome};
pub use config::{ControllerConfig, FloodgateConfig};
pub use error::{FloodgateError, Result};
pub use middleware::{AdmissionError, AdmissionMiddleware, Handler, RejectionPolicy, RequestContext};
pub use ratelimit::{LimiterRegistry, OperationLimitSpec, TokenBucket};
