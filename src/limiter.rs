//! Shared bandwidth ceiling enforced as a token bucket.
//!
//! One limiter instance is shared by every relay in the server, so the
//! aggregate throughput across all concurrent connections stays at or
//! below the configured ceiling, the way a single physical link would
//! behave. The bucket holds at most one second's worth of bytes, which
//! bounds the worst-case burst after an idle period to the ceiling
//! itself.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::{sleep, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Upper bound on a single `acquire` request; anything larger is a
/// caller bug, not a runtime condition.
const MAX_ACQUIRE: usize = 1 << 30;

/// A token bucket measured in bytes, refilled continuously at the
/// ceiling rate.
pub struct RateLimiter {
    /// Bytes per second. `0` means unlimited.
    ceiling: u64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    /// Bytes still permitted in the current window. Goes negative when a
    /// caller overdraws; the overdraft converts into that caller's wait.
    budget: i64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter for the given ceiling in bytes per second.
    ///
    /// A ceiling of `0` disables throttling entirely. The bucket starts
    /// full, permitting an initial burst of one second's worth of bytes.
    pub fn new(ceiling: u64) -> Self {
        RateLimiter {
            ceiling,
            bucket: Mutex::new(Bucket {
                budget: ceiling.min(i64::MAX as u64) as i64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The configured ceiling in bytes per second; `0` means unlimited.
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// `true` when the limiter never delays callers.
    pub fn is_unlimited(&self) -> bool {
        self.ceiling == 0
    }

    /// Wait until transferring `n` bytes keeps the caller at or below the
    /// ceiling, then debit them from the budget.
    ///
    /// Concurrent callers serialize their debits, so the sum granted over
    /// any trailing one-second window stays within the ceiling, give or
    /// take one chunk. A request larger than the ceiling itself is
    /// granted after a proportionally longer wait rather than rejected.
    pub async fn acquire(&self, n: usize) {
        debug_assert!(n <= MAX_ACQUIRE, "acquire({n}) exceeds any sane chunk size");

        if self.ceiling == 0 || n == 0 {
            return;
        }

        let wait = {
            let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
            bucket.refill(self.ceiling);
            bucket.budget -= n as i64;
            if bucket.budget < 0 {
                // The overdraft is paid back by waiting out the refill.
                Duration::from_secs_f64(-bucket.budget as f64 / self.ceiling as f64)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

impl Bucket {
    fn refill(&mut self, ceiling: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let added = elapsed.as_nanos() * u128::from(ceiling) / NANOS_PER_SEC;
        if added == 0 {
            // Not enough time has passed to mint a whole byte; keep the
            // fractional remainder by leaving the refill clock alone.
            return;
        }

        self.last_refill = now;
        let cap = i128::from(ceiling.min(i64::MAX as u64));
        self.budget = (i128::from(self.budget) + added as i128).min(cap) as i64;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::{Duration, Instant};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.acquire(10_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(limiter.is_unlimited());
    }

    #[tokio::test(start_paused = true)]
    async fn initial_burst_is_one_second_of_budget() {
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn overdraft_waits_proportionally() {
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await; // burn the initial budget

        let start = Instant::now();
        limiter.acquire(500).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(490), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_is_granted_with_a_longer_wait() {
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(5000).await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_does_not_accumulate_past_the_ceiling() {
        let limiter = RateLimiter::new(1000);
        tokio::time::sleep(Duration::from_secs(60)).await;

        limiter.acquire(1000).await; // the capped refill covers this
        let start = Instant::now();
        limiter.acquire(1000).await; // this one must wait a full second
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_budget() {
        let limiter = Arc::new(RateLimiter::new(1000));
        let start = Instant::now();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire(1000).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // 3000 bytes against a full 1000-byte bucket: at least two more
        // seconds regardless of interleaving.
        assert!(start.elapsed() >= Duration::from_millis(1990));
    }
}
