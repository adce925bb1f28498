//! Rolling statistics window.
//!
//! The window is a ring of fixed-width buckets indexed by wall-clock time
//! since the window's origin. Each bucket carries the index it was last
//! reset for; a writer landing on a bucket stamped with an older index resets
//! it first, which is how stale buckets are evicted. All counters are plain
//! atomics so concurrent writers never block each other. A sample that races
//! a reset may be dropped; the estimate only needs approximate counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::controller::Outcome;

#[derive(Debug, Default)]
struct WindowBucket {
    /// Bucket index + 1 this slot currently holds; 0 means never used.
    stamp: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    rt_sum_us: AtomicU64,
    rt_count: AtomicU64,
}

impl WindowBucket {
    fn reset(&self) {
        self.accepted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.canceled.store(0, Ordering::Relaxed);
        self.rt_sum_us.store(0, Ordering::Relaxed);
        self.rt_count.store(0, Ordering::Relaxed);
    }
}

/// Totals across every live bucket, current one included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub accepted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
}

/// Aggregates used by capacity estimation.
///
/// `max_pass` and `min_rt` only consider completed buckets: the current
/// bucket is still filling and would bias both downwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSummary {
    /// Highest number of successful completions in a single completed bucket
    pub max_pass: Option<u64>,
    /// Lowest mean latency of a completed bucket
    pub min_rt: Option<Duration>,
    pub totals: WindowTotals,
}

/// A time-bucketed rolling window of request statistics.
#[derive(Debug)]
pub struct RollingWindow {
    buckets: Box<[WindowBucket]>,
    bucket_width: Duration,
    origin: Instant,
}

impl RollingWindow {
    /// Create a window of `bucket_count` buckets spanning `width` in total.
    pub fn new(width: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_width = (width / bucket_count as u32).max(Duration::from_millis(1));
        let buckets = (0..bucket_count).map(|_| WindowBucket::default()).collect();
        Self {
            buckets,
            bucket_width,
            origin: Instant::now(),
        }
    }

    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of buckets that fit in one second.
    pub fn buckets_per_second(&self) -> f64 {
        1.0 / self.bucket_width.as_secs_f64()
    }

    /// Index of the bucket covering `now`.
    pub fn index_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.bucket_width.as_nanos()) as u64
    }

    fn bucket_for(&self, index: u64) -> &WindowBucket {
        let bucket = &self.buckets[(index % self.buckets.len() as u64) as usize];
        let stamp = index + 1;
        let seen = bucket.stamp.load(Ordering::Acquire);
        if seen < stamp
            && bucket
                .stamp
                .compare_exchange(seen, stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.reset();
        }
        bucket
    }

    fn current(&self, now: Instant) -> &WindowBucket {
        self.bucket_for(self.index_at(now))
    }

    pub fn record_accepted(&self, now: Instant) {
        self.current(now).accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, now: Instant) {
        self.current(now).rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished request. Canceled requests do not contribute latency.
    pub fn record_completion(&self, now: Instant, outcome: Outcome, rt: Duration) {
        let bucket = self.current(now);
        let counter = match outcome {
            Outcome::Success => &bucket.succeeded,
            Outcome::Failure => &bucket.failed,
            Outcome::Canceled => {
                bucket.canceled.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        bucket
            .rt_sum_us
            .fetch_add(rt.as_micros() as u64, Ordering::Relaxed);
        bucket.rt_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Aggregate the trailing window as seen at `now`.
    pub fn summarize(&self, now: Instant) -> WindowSummary {
        let current = self.index_at(now);
        let oldest = (current + 1).saturating_sub(self.buckets.len() as u64);
        let mut summary = WindowSummary::default();

        for bucket in self.buckets.iter() {
            let stamp = bucket.stamp.load(Ordering::Acquire);
            if stamp == 0 {
                continue;
            }
            let index = stamp - 1;
            if index < oldest || index > current {
                continue;
            }

            let totals = &mut summary.totals;
            let succeeded = bucket.succeeded.load(Ordering::Relaxed);
            totals.accepted += bucket.accepted.load(Ordering::Relaxed);
            totals.rejected += bucket.rejected.load(Ordering::Relaxed);
            totals.succeeded += succeeded;
            totals.failed += bucket.failed.load(Ordering::Relaxed);
            totals.canceled += bucket.canceled.load(Ordering::Relaxed);

            if index == current {
                continue;
            }

            summary.max_pass = Some(summary.max_pass.map_or(succeeded, |m| m.max(succeeded)));

            let rt_count = bucket.rt_count.load(Ordering::Relaxed);
            if rt_count > 0 {
                let mean_us = bucket.rt_sum_us.load(Ordering::Relaxed) / rt_count;
                let mean = Duration::from_micros(mean_us);
                summary.min_rt = Some(summary.min_rt.map_or(mean, |m| m.min(mean)));
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_geometry() {
        let window = RollingWindow::new(Duration::from_secs(10), 100);
        assert_eq!(window.bucket_count(), 100);
        assert_eq!(window.bucket_width(), Duration::from_millis(100));
        assert!((window.buckets_per_second() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_follows_wall_clock() {
        let window = RollingWindow::new(Duration::from_secs(1), 10);
        let start = Instant::now();
        assert_eq!(window.index_at(start), 0);
        assert_eq!(window.index_at(start + Duration::from_millis(99)), 0);
        assert_eq!(window.index_at(start + Duration::from_millis(100)), 1);
        assert_eq!(window.index_at(start + Duration::from_millis(2350)), 23);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_bucket_excluded_from_estimates() {
        let window = RollingWindow::new(Duration::from_secs(1), 10);
        let now = Instant::now();
        window.record_completion(now, Outcome::Success, Duration::from_millis(5));

        let summary = window.summarize(now);
        assert_eq!(summary.totals.succeeded, 1);
        assert!(summary.max_pass.is_none());
        assert!(summary.min_rt.is_none());

        let later = now + Duration::from_millis(100);
        let summary = window.summarize(later);
        assert_eq!(summary.max_pass, Some(1));
        assert_eq!(summary.min_rt, Some(Duration::from_millis(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pass_and_min_rt_across_buckets() {
        let window = RollingWindow::new(Duration::from_secs(1), 10);
        let t0 = Instant::now();

        for _ in 0..3 {
            window.record_completion(t0, Outcome::Success, Duration::from_millis(20));
        }
        let t1 = t0 + Duration::from_millis(100);
        for _ in 0..7 {
            window.record_completion(t1, Outcome::Success, Duration::from_millis(8));
        }
        window.record_completion(t1, Outcome::Failure, Duration::from_millis(2));

        let summary = window.summarize(t0 + Duration::from_millis(250));
        assert_eq!(summary.max_pass, Some(7));
        // Bucket 1 mean: (7*8 + 2) / 8 = 7.25ms
        assert_eq!(summary.min_rt, Some(Duration::from_micros(7250)));
        assert_eq!(summary.totals.succeeded, 10);
        assert_eq!(summary.totals.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_does_not_record_latency() {
        let window = RollingWindow::new(Duration::from_secs(1), 10);
        let t0 = Instant::now();
        window.record_completion(t0, Outcome::Canceled, Duration::from_millis(1));

        let summary = window.summarize(t0 + Duration::from_millis(100));
        assert_eq!(summary.totals.canceled, 1);
        assert_eq!(summary.max_pass, Some(0));
        assert!(summary.min_rt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_buckets_are_evicted() {
        let window = RollingWindow::new(Duration::from_secs(1), 10);
        let t0 = Instant::now();
        window.record_accepted(t0);
        window.record_rejected(t0);

        let summary = window.summarize(t0 + Duration::from_millis(900));
        assert_eq!(summary.totals.accepted, 1);
        assert_eq!(summary.totals.rejected, 1);

        // One full window later the bucket has aged out even before reuse.
        let summary = window.summarize(t0 + Duration::from_millis(1000));
        assert_eq!(summary.totals, WindowTotals::default());

        // Reusing the slot resets it.
        let reuse = t0 + Duration::from_millis(1000);
        window.record_accepted(reuse);
        let summary = window.summarize(reuse);
        assert_eq!(summary.totals.accepted, 1);
        assert_eq!(summary.totals.rejected, 0);
    }
}
