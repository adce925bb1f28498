//! Admission rejections and their gRPC status mapping.

use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

/// Metadata key carrying the rejection reason on a rejected call.
pub const REJECT_REASON_KEY: &str = "x-floodgate-reject-reason";

/// Why the admission layer refused a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The global tier detected overload
    #[error("service unavailable due to overload")]
    ServiceOverloaded,

    /// The operation's token bucket had no permit in time
    #[error("rate limit exceeded for operation '{operation}'")]
    RateLimitExceeded { operation: String },

    /// No bucket is registered for the operation
    #[error("no rate limit configured for operation '{operation}'")]
    LimiterMisconfigured { operation: String },

    /// The caller canceled while waiting for a permit
    #[error("request for operation '{operation}' canceled while waiting for a permit")]
    Canceled { operation: String },
}

impl AdmissionError {
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::ServiceOverloaded => RejectReason::Overloaded,
            Self::RateLimitExceeded { .. } => RejectReason::RateLimited,
            Self::LimiterMisconfigured { .. } => RejectReason::Misconfigured,
            Self::Canceled { .. } => RejectReason::Canceled,
        }
    }

    /// Whether a client may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceOverloaded | Self::RateLimitExceeded { .. })
    }
}

/// Machine-readable rejection reason, written to response metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Overloaded,
    RateLimited,
    Misconfigured,
    Canceled,
}

impl RejectReason {
    /// Returns a static string label for metadata and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overloaded => "overloaded",
            Self::RateLimited => "rate_limited",
            Self::Misconfigured => "misconfigured",
            Self::Canceled => "canceled",
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::Overloaded => Code::Unavailable,
            Self::RateLimited => Code::ResourceExhausted,
            Self::Misconfigured => Code::Internal,
            Self::Canceled => Code::Cancelled,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "overloaded" => Some(Self::Overloaded),
            "rate_limited" => Some(Self::RateLimited),
            "misconfigured" => Some(Self::Misconfigured),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Recover the reason from a status produced by the admission layer.
    pub fn from_status(status: &Status) -> Option<Self> {
        let value = status.metadata().get(REJECT_REASON_KEY)?;
        Self::parse(value.to_str().ok()?)
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AdmissionError> for Status {
    fn from(err: AdmissionError) -> Self {
        let reason = err.reason();
        let mut status = Status::new(reason.code(), err.to_string());
        status
            .metadata_mut()
            .insert(REJECT_REASON_KEY, MetadataValue::from_static(reason.as_str()));
        status
    }
}
