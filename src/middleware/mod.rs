//! Request pipeline integration.
//!
//! [`AdmissionMiddleware`] wraps the next [`Handler`] in the pipeline and
//! applies global admission followed by the per-operation rate limit.

mod admission;
mod error;
mod handler;

pub use admission::{AdmissionMiddleware, RejectionPolicy};
pub use error::{AdmissionError, RejectReason, REJECT_REASON_KEY};
pub use handler::{Handler, RequestContext};
