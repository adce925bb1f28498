//! Capacity estimation for the adaptive admission controller.
//!
//! The controller feeds an [`EstimateInput`] built from cached window
//! statistics and the current pressure sample; the estimator answers with
//! the maximum number of requests allowed in flight, or `None` when no limit
//! should be enforced right now.

use std::time::Duration;

/// Everything an estimator may use to decide the in-flight ceiling.
#[derive(Debug, Clone, Copy)]
pub struct EstimateInput {
    /// Highest successful completions per bucket across the window (≥ 1)
    pub max_pass: u64,
    /// Lowest mean bucket latency across the window (≥ 1ms)
    pub min_rt: Duration,
    /// Window buckets per second
    pub buckets_per_second: f64,
    /// Smoothed resource pressure in [0, 1]
    pub pressure: f64,
    /// Configured pressure threshold
    pub pressure_threshold: f64,
    /// True while inside the cooldown that follows an overload rejection
    pub cooling: bool,
}

impl EstimateInput {
    pub fn under_pressure(&self) -> bool {
        self.pressure >= self.pressure_threshold
    }
}

/// Pluggable capacity estimation algorithm.
pub trait CapacityEstimator: Send + Sync + 'static {
    /// Maximum in-flight requests, or `None` for no limit.
    fn ceiling(&self, input: &EstimateInput) -> Option<u64>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Bottleneck-bandwidth estimator.
///
/// Sustainable concurrency is throughput times minimum latency: the peak
/// per-second completion rate multiplied by the best observed round trip.
/// The ceiling is only enforced while the process is under pressure, or
/// during the cooldown after an overload rejection so the limit does not
/// flap as pressure hovers around the threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct BbrEstimator;

impl BbrEstimator {
    /// `max_pass * min_rt_ms * buckets_per_second / 1000`, rounded, at least 1.
    pub fn bottleneck(input: &EstimateInput) -> u64 {
        let min_rt_ms = (input.min_rt.as_secs_f64() * 1000.0).ceil().max(1.0);
        let in_flight = input.max_pass as f64 * min_rt_ms * input.buckets_per_second / 1000.0;
        let estimate = (in_flight + 0.5).floor();
        (estimate as u64).max(1)
    }
}

impl CapacityEstimator for BbrEstimator {
    fn ceiling(&self, input: &EstimateInput) -> Option<u64> {
        if input.under_pressure() || input.cooling {
            Some(Self::bottleneck(input))
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "bbr"
    }
}

/// Static ceiling regardless of statistics or pressure.
#[derive(Debug, Clone, Copy)]
pub struct FixedCeiling(pub u64);

impl CapacityEstimator for FixedCeiling {
    fn ceiling(&self, _input: &EstimateInput) -> Option<u64> {
        Some(self.0)
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}
