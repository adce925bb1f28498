//! Per-operation rate limiting: token buckets and the registry that maps
//! operation identifiers to them.

mod bucket;
mod registry;
mod rules;

pub use bucket::{AcquireError, BucketSnapshot, TokenBucket};
pub use registry::LimiterRegistry;
pub use rules::{validate_batch, OperationLimitSpec};
