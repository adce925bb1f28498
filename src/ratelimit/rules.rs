//! Per-operation limit rules.
//!
//! An [`OperationLimitSpec`] describes the token bucket guarding one protocol
//! method: its sustained rate, burst capacity and how long a request may queue
//! for a permit. Specs arrive from configuration as an ordered batch and are
//! validated before any bucket is built from them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// Limit configuration for a single protected operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLimitSpec {
    /// Unique operation identifier, usually the full gRPC method path
    pub operation: String,
    /// Sustained permits per second
    pub rate: f64,
    /// Maximum instantaneous permit capacity
    pub burst: u32,
    /// How long a request may wait for a permit; zero rejects immediately.
    /// Configured as (possibly fractional) milliseconds.
    #[serde(rename = "wait_timeout_ms", default, with = "millis")]
    pub wait_timeout: Duration,
}

impl OperationLimitSpec {
    /// Create a new spec.
    pub fn new(
        operation: impl Into<String>,
        rate: f64,
        burst: u32,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            operation: operation.into(),
            rate,
            burst,
            wait_timeout,
        }
    }

    /// Maximum queueing time for a permit.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Check that a bucket can be built from this spec.
    pub fn validate(&self) -> Result<()> {
        if self.operation.is_empty() {
            return Err(self.invalid("operation identifier must not be empty"));
        }
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(self.invalid(format!("rate must be a positive number, got {}", self.rate)));
        }
        if self.burst < 1 {
            return Err(self.invalid("burst must be at least 1"));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> FloodgateError {
        FloodgateError::InvalidSpec {
            operation: self.operation.clone(),
            reason: reason.into(),
        }
    }
}

/// Serde adapter for durations written as fractional milliseconds.
mod millis {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1e6)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(D::Error::custom(format!(
                "wait_timeout_ms must be a non-negative number, got {}",
                ms
            )));
        }
        Ok(Duration::from_nanos((ms * 1e6).round() as u64))
    }
}

/// Validate a configuration batch: every spec must be valid and every
/// operation identifier unique within the batch.
pub fn validate_batch(specs: &[OperationLimitSpec]) -> Result<()> {
    let mut seen = HashSet::with_capacity(specs.len());
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.operation.as_str()) {
            return Err(FloodgateError::DuplicateOperation(spec.operation.clone()));
        }
    }
    Ok(())
}
