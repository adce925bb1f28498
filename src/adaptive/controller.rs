//! Process-wide adaptive admission controller.
//!
//! `admit` and report are O(1) on the request path: the in-flight counter is
//! a single atomic, window statistics are atomics in the current bucket, and
//! the window aggregates the estimator needs are recomputed once per bucket
//! rollover by whichever caller first observes the new bucket.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::estimator::{BbrEstimator, CapacityEstimator, EstimateInput};
use super::window::{RollingWindow, WindowTotals};
use crate::config::ControllerConfig;

/// How an admitted request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Canceled,
}

/// The global tier refused a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("service overloaded: {in_flight} in flight, ceiling {ceiling}")]
pub struct Overloaded {
    pub in_flight: u64,
    pub ceiling: u64,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub estimator: &'static str,
    pub in_flight: u64,
    /// Ceiling that would apply to the next admission; `None` means unbounded
    pub ceiling: Option<u64>,
    pub pressure: f64,
    pub max_pass: u64,
    pub min_rt: Duration,
    pub totals: WindowTotals,
}

/// Global overload detector.
pub struct AdaptiveAdmissionController {
    window: RollingWindow,
    estimator: Box<dyn CapacityEstimator>,
    pressure_threshold: f64,
    pressure_decay: f64,
    cooldown: Duration,
    origin: Instant,

    in_flight: AtomicU64,
    /// Smoothed pressure as `f64` bits
    pressure: AtomicU64,

    /// Window index + 1 the cached aggregates were computed for
    stats_stamp: AtomicU64,
    max_pass: AtomicU64,
    min_rt_us: AtomicU64,

    /// Microseconds since `origin` + 1 of the last rejection under pressure; 0 = never
    last_overload_us: AtomicU64,
}

impl AdaptiveAdmissionController {
    /// Create a controller using the bottleneck-bandwidth estimator.
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_estimator(config, BbrEstimator)
    }

    /// Create a controller with a custom estimator.
    pub fn with_estimator<E: CapacityEstimator>(config: &ControllerConfig, estimator: E) -> Self {
        debug!(
            estimator = estimator.name(),
            window_ms = config.window_ms,
            bucket_count = config.bucket_count,
            pressure_threshold = config.pressure_threshold,
            "Creating adaptive admission controller"
        );

        Self {
            window: RollingWindow::new(config.window(), config.bucket_count),
            estimator: Box::new(estimator),
            pressure_threshold: config.pressure_threshold,
            pressure_decay: config.pressure_decay.clamp(0.0, 1.0),
            cooldown: config.cooldown(),
            origin: Instant::now(),
            in_flight: AtomicU64::new(0),
            pressure: AtomicU64::new(0f64.to_bits()),
            stats_stamp: AtomicU64::new(0),
            max_pass: AtomicU64::new(1),
            min_rt_us: AtomicU64::new(1_000),
            last_overload_us: AtomicU64::new(0),
        }
    }

    /// Try to admit a request.
    ///
    /// Never blocks. The returned token must be completed (or dropped) when
    /// the request finishes so the in-flight count and statistics stay exact.
    pub fn admit(self: &Arc<Self>) -> Result<AdmissionToken, Overloaded> {
        let now = Instant::now();
        self.refresh_stats(now);

        let input = self.estimate_input(now);
        let ceiling = self.estimator.ceiling(&input);

        let admitted = match ceiling {
            None => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(ceiling) => self
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < ceiling).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|in_flight| Overloaded { in_flight, ceiling }),
        };

        if let Err(overloaded) = admitted {
            self.window.record_rejected(now);
            if input.under_pressure() {
                self.last_overload_us
                    .store(self.micros_since_origin(now) + 1, Ordering::Release);
            }
            debug!(
                in_flight = overloaded.in_flight,
                ceiling = overloaded.ceiling,
                pressure = input.pressure,
                "Global admission rejected"
            );
            return Err(overloaded);
        }

        self.window.record_accepted(now);
        Ok(AdmissionToken {
            controller: Some(Arc::clone(self)),
            started: now,
        })
    }

    /// Report the outcome of an admitted request.
    pub fn report(&self, token: AdmissionToken, outcome: Outcome) {
        token.complete(outcome);
    }

    /// Fold a raw pressure reading into the smoothed value and return it.
    ///
    /// Non-finite readings are ignored.
    pub fn record_pressure(&self, sample: f64) -> f64 {
        if !sample.is_finite() {
            return self.pressure();
        }
        let sample = sample.clamp(0.0, 1.0);
        let decay = self.pressure_decay;
        let previous = self
            .pressure
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let old = f64::from_bits(bits);
                Some((old * decay + sample * (1.0 - decay)).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        f64::from_bits(previous) * decay + sample * (1.0 - decay)
    }

    /// Current smoothed pressure.
    pub fn pressure(&self) -> f64 {
        f64::from_bits(self.pressure.load(Ordering::Acquire))
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let now = Instant::now();
        self.refresh_stats(now);
        let input = self.estimate_input(now);
        ControllerSnapshot {
            estimator: self.estimator.name(),
            in_flight: self.in_flight(),
            ceiling: self.estimator.ceiling(&input),
            pressure: input.pressure,
            max_pass: input.max_pass,
            min_rt: input.min_rt,
            totals: self.window.summarize(now).totals,
        }
    }

    fn micros_since_origin(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_micros() as u64
    }

    fn estimate_input(&self, now: Instant) -> EstimateInput {
        let last = self.last_overload_us.load(Ordering::Acquire);
        let since_overload = (self.micros_since_origin(now) + 1).saturating_sub(last);
        let cooling = last != 0 && since_overload <= self.cooldown.as_micros() as u64;

        EstimateInput {
            max_pass: self.max_pass.load(Ordering::Acquire),
            min_rt: Duration::from_micros(self.min_rt_us.load(Ordering::Acquire)),
            buckets_per_second: self.window.buckets_per_second(),
            pressure: self.pressure(),
            pressure_threshold: self.pressure_threshold,
            cooling,
        }
    }

    fn refresh_stats(&self, now: Instant) {
        let stamp = self.window.index_at(now) + 1;
        let seen = self.stats_stamp.load(Ordering::Acquire);
        if seen >= stamp
            || self
                .stats_stamp
                .compare_exchange(seen, stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let summary = self.window.summarize(now);
        let max_pass = summary.max_pass.unwrap_or(1).max(1);
        let min_rt = summary
            .min_rt
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_millis(1));
        self.max_pass.store(max_pass, Ordering::Release);
        self.min_rt_us.store(min_rt.as_micros() as u64, Ordering::Release);

        trace!(
            max_pass = max_pass,
            min_rt_us = min_rt.as_micros() as u64,
            "Window aggregates refreshed"
        );
    }

    fn finish(&self, started: Instant, outcome: Option<Outcome>) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(outcome) = outcome {
            let now = Instant::now();
            self.window
                .record_completion(now, outcome, now.saturating_duration_since(started));
        }
    }
}

/// Proof of global admission.
///
/// Completing the token reports the outcome. A token dropped without being
/// completed reports `Failure` if the thread is unwinding and `Canceled`
/// otherwise (the request future was dropped).
#[must_use = "dropping an admission token reports the request as canceled"]
pub struct AdmissionToken {
    controller: Option<Arc<AdaptiveAdmissionController>>,
    started: Instant,
}

impl AdmissionToken {
    /// Report the request's outcome.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(controller) = self.controller.take() {
            controller.finish(self.started, Some(outcome));
        }
    }

    /// Release the in-flight slot without recording any statistics.
    pub fn discard(mut self) {
        if let Some(controller) = self.controller.take() {
            controller.finish(self.started, None);
        }
    }

    /// Time since admission.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionToken")
            .field("started", &self.started)
            .field("armed", &self.controller.is_some())
            .finish()
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            let outcome = if std::thread::panicking() {
                Outcome::Failure
            } else {
                Outcome::Canceled
            };
            controller.finish(self.started, Some(outcome));
        }
    }
}
