//! Token bucket with bounded waiting.

use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::rules::OperationLimitSpec;

/// Why a permit could not be acquired.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// No permit would become available before the deadline
    #[error("rate limit exceeded")]
    LimitExceeded,
    /// The caller's cancellation fired while waiting
    #[error("canceled while waiting for a permit")]
    Canceled,
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub rate: f64,
    pub burst: u32,
    pub available_tokens: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket guarding a single operation.
///
/// Tokens accrue continuously at `rate` per second up to `burst`. The state
/// lock is only held for the refill arithmetic, never across a wait.
#[derive(Debug)]
pub struct TokenBucket {
    spec: OperationLimitSpec,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket from a validated spec.
    pub fn new(spec: OperationLimitSpec) -> Self {
        debug_assert!(spec.validate().is_ok(), "bucket built from invalid spec");
        let state = Mutex::new(BucketState {
            tokens: spec.burst as f64,
            last_refill: Instant::now(),
        });
        Self { spec, state }
    }

    /// The spec this bucket was built from.
    pub fn spec(&self) -> &OperationLimitSpec {
        &self.spec
    }

    pub fn operation(&self) -> &str {
        &self.spec.operation
    }

    fn refill_locked(spec: &OperationLimitSpec, st: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(st.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * spec.rate).min(spec.burst as f64);
            st.last_refill = now;
        }
    }

    /// Take one permit if it is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock();
        Self::refill_locked(&self.spec, &mut st, Instant::now());
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Acquire one permit, waiting at most the configured wait timeout.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        let deadline = Instant::now() + self.spec.wait_timeout();
        self.acquire_until(deadline, cancel).await
    }

    /// Acquire one permit, waiting no later than `deadline`.
    ///
    /// Returns [`AcquireError::LimitExceeded`] as soon as it is clear that no
    /// permit will accrue in time, and [`AcquireError::Canceled`] promptly when
    /// `cancel` fires during a wait.
    pub async fn acquire_until(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        loop {
            let wait = {
                let mut st = self.state.lock();
                let now = Instant::now();
                Self::refill_locked(&self.spec, &mut st, now);

                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    return Ok(());
                }

                let missing = 1.0 - st.tokens;
                let wait = Duration::from_nanos((missing / self.spec.rate * 1e9).ceil() as u64)
                    .max(Duration::from_nanos(1));
                if now + wait > deadline {
                    trace!(
                        operation = %self.spec.operation,
                        wait_ms = wait.as_secs_f64() * 1000.0,
                        "No permit before deadline"
                    );
                    return Err(AcquireError::LimitExceeded);
                }
                wait
            };

            if cancel.is_cancelled() {
                return Err(AcquireError::Canceled);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AcquireError::Canceled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let mut st = self.state.lock();
        Self::refill_locked(&self.spec, &mut st, Instant::now());
        BucketSnapshot {
            rate: self.spec.rate,
            burst: self.spec.burst,
            available_tokens: st.tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use tokio_test::{assert_pending, assert_ready_eq};

    fn bucket(rate: f64, burst: u32, wait: Duration) -> TokenBucket {
        TokenBucket::new(OperationLimitSpec::new("op", rate, burst, wait))
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_bucket_starts_full() {
        let b = bucket(10.0, 5, Duration::ZERO);
        assert_eq!(b.snapshot().available_tokens, 5.0);

        for _ in 0..5 {
            assert!(b.try_acquire());
        }
        assert!(!b.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_burst() {
        let b = bucket(100.0, 3, Duration::ZERO);
        for _ in 0..3 {
            assert!(b.try_acquire());
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(b.snapshot().available_tokens, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_wait_rejects_immediately() {
        let b = bucket(1.0, 1, Duration::ZERO);
        let cancel = CancellationToken::new();

        assert_eq!(b.acquire(&cancel).await, Ok(()));

        let start = Instant::now();
        assert_eq!(b.acquire(&cancel).await, Err(AcquireError::LimitExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_without_waiting_when_deadline_too_short() {
        // One token per second, but only 100ms of patience.
        let b = bucket(1.0, 1, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        assert!(b.acquire(&cancel).await.is_ok());

        let start = Instant::now();
        assert_eq!(b.acquire(&cancel).await, Err(AcquireError::LimitExceeded));
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_short_wait() {
        let b = bucket(2000.0, 2000, Duration::from_secs(3));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..2000 {
            assert!(b.acquire(&cancel).await.is_ok());
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The 2001st waits roughly 1/2000s (rounded up to the timer tick).
        let waited = Instant::now();
        assert!(b.acquire(&cancel).await.is_ok());
        let elapsed = waited.elapsed();
        assert!(elapsed >= Duration::from_micros(500), "waited {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2), "waited {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admissions_bounded_by_burst_plus_rate() {
        let rate = 50.0;
        let burst = 10;
        let b = bucket(rate, burst, Duration::ZERO);

        let start = Instant::now();
        let mut admitted = 0u32;
        for _ in 0..400 {
            if b.try_acquire() {
                admitted += 1;
            }
            tokio::time::advance(Duration::from_millis(5)).await;
            let elapsed = start.elapsed().as_secs_f64();
            assert!(
                admitted as f64 <= burst as f64 + rate * elapsed + 1e-9,
                "admitted {} after {:.3}s",
                admitted,
                elapsed
            );
        }
        // Two seconds of traffic: 10 burst + ~100 accrued.
        assert!(admitted >= 80, "admitted only {}", admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_admits_exactly_burst() {
        // Refill is negligible for the lifetime of the test.
        let b = Arc::new(bucket(0.001, 8, Duration::ZERO));
        let admitted = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(32));

        let tasks = (0..32).map(|_| {
            let b = b.clone();
            let admitted = admitted.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                let cancel = CancellationToken::new();
                if b.acquire(&cancel).await.is_ok() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        });
        for r in join_all(tasks).await {
            r.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 8);
        assert!(b.snapshot().available_tokens < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_timeout_can_wait() {
        // The next token accrues after 500us, inside the 900us budget.
        let b = bucket(2000.0, 1, Duration::from_micros(900));
        let cancel = CancellationToken::new();
        assert!(b.acquire(&cancel).await.is_ok());

        assert_eq!(b.acquire(&cancel).await, Ok(()));

        // Nothing accrues within 100us.
        let b = bucket(2000.0, 1, Duration::from_micros(100));
        assert!(b.acquire(&cancel).await.is_ok());
        assert_eq!(b.acquire(&cancel).await, Err(AcquireError::LimitExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_respect_deadline() {
        // Burst 2, one token every 100ms, 250ms patience: 2 immediate + 2 queued.
        let b = Arc::new(bucket(10.0, 2, Duration::from_millis(250)));

        let tasks = (0..6).map(|_| {
            let b = b.clone();
            tokio::spawn(async move { b.acquire(&CancellationToken::new()).await })
        });
        let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let exceeded = results
            .iter()
            .filter(|r| **r == Err(AcquireError::LimitExceeded))
            .count();
        assert_eq!(ok, 4);
        assert_eq!(exceeded, 2);
        assert!(b.snapshot().available_tokens >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_waiter() {
        let b = Arc::new(bucket(0.1, 1, Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        assert!(b.acquire(&cancel).await.is_ok());

        let waiter = {
            let b = b.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                (b.acquire(&cancel).await, start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let (result, waited) = waiter.await.unwrap();
        assert_eq!(result, Err(AcquireError::Canceled));
        assert!(waited < Duration::from_secs(1), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_pending_until_refill() {
        let b = bucket(10.0, 1, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        assert!(b.try_acquire());

        let mut waiter = tokio_test::task::spawn(b.acquire(&cancel));
        assert_pending!(waiter.poll());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_pending!(waiter.poll());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_ready_eq!(waiter.poll(), Ok(()));
        assert!(!b.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_canceled_fails_before_waiting() {
        let b = bucket(1.0, 1, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        assert!(b.acquire(&cancel).await.is_ok());

        cancel.cancel();
        assert_eq!(b.acquire(&cancel).await, Err(AcquireError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_permit_ignores_cancellation() {
        let b = bucket(1.0, 1, Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(b.acquire(&cancel).await, Ok(()));
    }
}
