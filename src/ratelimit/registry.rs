//! Operation → token bucket registry.
//!
//! Reads happen once per request and go through `ArcSwap::load()`, so the hot
//! path never takes a lock. Writes build a fresh immutable map and publish it
//! with a single pointer swap; readers see either the old map or the new one,
//! never a partial update. Writers are serialized by a mutex.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::bucket::TokenBucket;
use super::rules::{validate_batch, OperationLimitSpec};
use crate::error::Result;

type BucketMap = HashMap<String, Arc<TokenBucket>>;

/// Concurrent-safe mapping from operation identifier to its [`TokenBucket`].
pub struct LimiterRegistry {
    buckets: ArcSwap<BucketMap>,
    writer: Mutex<()>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            buckets: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Build a registry from a configuration batch.
    pub fn from_specs(specs: &[OperationLimitSpec]) -> Result<Self> {
        let registry = Self::new();
        registry.replace_all(specs)?;
        Ok(registry)
    }

    /// Register or update the limit for one operation.
    ///
    /// Re-registering an identical spec keeps the live bucket untouched; a
    /// changed spec replaces it with a fresh, full bucket.
    pub fn register(&self, spec: OperationLimitSpec) -> Result<()> {
        spec.validate()?;
        let _guard = self.writer.lock();

        let current = self.buckets.load_full();
        if let Some(existing) = current.get(&spec.operation) {
            if existing.spec() == &spec {
                debug!(operation = %spec.operation, "Limit already registered");
                return Ok(());
            }
        }

        info!(
            operation = %spec.operation,
            rate = spec.rate,
            burst = spec.burst,
            wait_timeout_ms = spec.wait_timeout.as_secs_f64() * 1000.0,
            "Registering operation limit"
        );

        let mut next = (*current).clone();
        next.insert(spec.operation.clone(), Arc::new(TokenBucket::new(spec)));
        self.buckets.store(Arc::new(next));
        Ok(())
    }

    /// Atomically replace the whole registry with a new batch.
    ///
    /// The batch is validated first; on error the published map is unchanged.
    /// Operations whose spec did not change keep their live bucket state.
    pub fn replace_all(&self, specs: &[OperationLimitSpec]) -> Result<()> {
        validate_batch(specs)?;
        let _guard = self.writer.lock();

        let current = self.buckets.load_full();
        let mut next = HashMap::with_capacity(specs.len());
        let mut reused = 0usize;

        for spec in specs {
            let bucket = match current.get(&spec.operation) {
                Some(existing) if existing.spec() == spec => {
                    reused += 1;
                    existing.clone()
                }
                _ => Arc::new(TokenBucket::new(spec.clone())),
            };
            next.insert(spec.operation.clone(), bucket);
        }

        let removed = current.keys().filter(|op| !next.contains_key(*op)).count();
        self.buckets.store(Arc::new(next));

        info!(
            operations = specs.len(),
            reused = reused,
            removed = removed,
            "Published operation limits"
        );
        Ok(())
    }

    /// Resolve the bucket for an operation, if one is configured.
    pub fn resolve(&self, operation: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.load().get(operation).cloned()
    }

    /// Configured operation identifiers, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.buckets.load().keys().cloned().collect();
        ops.sort();
        ops
    }

    /// Number of configured operations.
    pub fn len(&self) -> usize {
        self.buckets.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
