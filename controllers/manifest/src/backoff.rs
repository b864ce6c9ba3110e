//! # Requeue Rate Limiting
//!
//! Decides how long a Manifest waits before it is reconciled again after an
//! immediate requeue or a failure.
//!
//! Two limiters are combined and the longer delay wins:
//! - a per-key exponential backoff (1s, 2s, 4s, ... capped at 1000s) that is
//!   reset once the key settles, and
//! - a global token bucket (30 qps, burst of 200) shared by every key.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket handing out delays instead of rejecting requests.
///
/// Tokens may go negative; the deficit divided by the rate is how long the
/// caller has to wait for its token.
#[derive(Debug)]
struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(qps: f64, burst: u32, now: Instant) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last: now,
        }
    }

    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Combined per-key exponential and global token bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(1000), 30.0, 200)
    }
}

impl RateLimiter {
    /// Creates a limiter backing off from `base` to `max` per key, with a
    /// bucket refilling at `qps` up to `burst` tokens.
    #[must_use]
    pub fn new(base: Duration, max: Duration, qps: f64, burst: u32) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket::new(qps, burst, Instant::now())),
        }
    }

    /// Delay before `key` is retried; every call counts as one more failure.
    pub fn when(&self, key: &str) -> Duration {
        self.when_at(key, Instant::now())
    }

    fn when_at(&self, key: &str, now: Instant) -> Duration {
        let exponential = {
            let mut failures = self.failures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let count = failures.entry(key.to_string()).or_insert(0);
            let delay = self.base.saturating_mul(2u32.saturating_pow(*count)).min(self.max);
            *count = count.saturating_add(1);
            delay
        };
        let bucket = self
            .bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .reserve(now);
        exponential.max(bucket)
    }

    /// Resets the backoff of `key` once it settled.
    pub fn forget(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    /// Number of delays handed out for `key` since it was last forgotten.
    #[must_use]
    pub fn retries(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Randomizes `interval` by up to `factor` in either direction.
#[must_use]
pub fn jitter(interval: Duration, factor: f64) -> Duration {
    if interval.is_zero() || factor <= 0.0 {
        return interval;
    }
    let scale = rand::rng().random_range((1.0 - factor)..=(1.0 + factor));
    interval.mul_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_key_only() -> RateLimiter {
        // Bucket large enough to never delay
        RateLimiter::new(Duration::from_secs(1), Duration::from_secs(1000), 1000.0, 10_000)
    }

    #[test]
    fn test_exponential_sequence_is_capped() {
        let limiter = per_key_only();

        // 1s, 2s, 4s, ... 512s, then capped at 1000s
        let delays: Vec<u64> = (0..12).map(|_| limiter.when("default/m").as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1000, 1000]);
        assert_eq!(limiter.retries("default/m"), 12);
    }

    #[test]
    fn test_keys_back_off_independently() {
        let limiter = per_key_only();

        limiter.when("a");
        limiter.when("a");
        assert_eq!(limiter.when("a"), Duration::from_secs(4));
        assert_eq!(limiter.when("b"), Duration::from_secs(1));
    }

    #[test]
    fn test_forget_restarts_the_sequence() {
        let limiter = per_key_only();

        limiter.when("a");
        limiter.when("a");
        limiter.forget("a");

        assert_eq!(limiter.retries("a"), 0);
        assert_eq!(limiter.when("a"), Duration::from_secs(1));
    }

    #[test]
    fn test_bucket_delays_after_burst() {
        let limiter = RateLimiter::new(Duration::ZERO, Duration::ZERO, 30.0, 200);
        let now = Instant::now();

        for i in 0..200 {
            assert_eq!(limiter.when_at(&format!("k{i}"), now), Duration::ZERO);
        }
        // One token short at 30 qps
        let delay = limiter.when_at("k200", now);
        assert!(delay > Duration::from_millis(30) && delay < Duration::from_millis(40), "{delay:?}");

        // A second later 30 tokens are back
        let later = now + Duration::from_secs(1);
        assert_eq!(limiter.when_at("k201", later), Duration::ZERO);
    }

    #[test]
    fn test_larger_delay_wins() {
        let limiter = RateLimiter::new(Duration::from_secs(1), Duration::from_secs(1000), 30.0, 1);
        let now = Instant::now();

        assert_eq!(limiter.when_at("a", now), Duration::from_secs(1));
        // Bucket is empty but the per-key backoff is longer
        assert_eq!(limiter.when_at("a", now), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let interval = Duration::from_secs(30);
        for _ in 0..100 {
            let jittered = jitter(interval, 0.1);
            assert!(jittered >= Duration::from_millis(26_999) && jittered <= Duration::from_millis(33_001));
        }
        assert_eq!(jitter(Duration::ZERO, 0.1), Duration::ZERO);
        assert_eq!(jitter(interval, 0.0), interval);
    }
}
