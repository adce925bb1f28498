//! Request pipeline abstractions.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;

/// Per-request context supplied by the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    operation: String,
    cancel: CancellationToken,
    metadata: MetadataMap,
}

impl RequestContext {
    /// Create a context for a call to `operation`.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            cancel: CancellationToken::new(),
            metadata: MetadataMap::new(),
        }
    }

    /// Tie the request to an externally owned cancellation signal.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// The protocol method being invoked.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }
}

/// A stage in the request pipeline.
///
/// Implementations must be safe to share across tasks; every request is
/// handled through `&self`.
#[async_trait]
pub trait Handler: Send + Sync {
    type Request: Send + 'static;
    type Response: Send + 'static;

    async fn call(
        &self,
        ctx: &RequestContext,
        request: Self::Request,
    ) -> Result<Self::Response, Status>;
}
