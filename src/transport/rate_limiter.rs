//! Process-wide request rate limiter
//!
//! Token bucket sized in requests-per-second with a bounded wait: a caller
//! that would have to sleep past `max_backoff` is rejected instead of queued
//! forever. Cancelled callers never consume a token, so dropped futures
//! release capacity by construction.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TransportError;

/// Internal bucket state, guarded by one mutex. Tokens are tracked in
/// micro-units so refill stays in integer math.
struct BucketState {
    micro_tokens: u64,
    last_refill: Instant,
}

const MICRO: u64 = 1_000_000;

pub struct RateLimiter {
    /// Sustained rate, requests per second
    rps: u32,
    /// Burst capacity equals one second of tokens
    capacity_micro: u64,
    max_backoff: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(rps: u32, max_backoff: Duration) -> Self {
        let rps = rps.max(1);
        let capacity_micro = u64::from(rps) * MICRO;
        Self {
            rps,
            capacity_micro,
            max_backoff,
            state: Mutex::new(BucketState {
                micro_tokens: capacity_micro,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire one request token, sleeping as needed. Errors if the required
    /// wait exceeds the configured max backoff.
    pub async fn acquire(&self) -> Result<(), TransportError> {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("rate limiter mutex poisoned");
                self.refill(&mut state);
                if state.micro_tokens >= MICRO {
                    state.micro_tokens -= MICRO;
                    return Ok(());
                }
                let deficit = MICRO - state.micro_tokens;
                // deficit micro-tokens at rps tokens/sec
                Duration::from_micros(deficit / u64::from(self.rps))
            };
            if wait > self.max_backoff {
                return Err(TransportError::BackoffExceeded(self.max_backoff.as_secs()));
            }
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        let refill = elapsed.as_micros() as u64 * u64::from(self.rps);
        state.micro_tokens = (state.micro_tokens + refill).min(self.capacity_micro);
        state.last_refill = now;
    }

    /// Tokens currently available (diagnostics only).
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        self.refill(&mut state);
        (state.micro_tokens / MICRO) as u32
    }
}

/// Exponential backoff for retry loops: base doubles per attempt, capped.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(16);
    base.checked_mul(factor).map(|d| d.min(max)).unwrap_or(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_within_capacity() {
        let limiter = RateLimiter::new(10, Duration::from_secs(5));
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(10, Duration::from_secs(5));
        for _ in 0..10 {
            limiter.acquire().await.unwrap();
        }
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.available(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_token() {
        let limiter = RateLimiter::new(2, Duration::from_secs(5));
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let start = Instant::now();
        limiter.acquire().await.unwrap();
        // Third acquire needed ~half a second of refill
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_backoff_exceeded() {
        let limiter = RateLimiter::new(1, Duration::from_millis(1));
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, TransportError::BackoffExceeded(_)));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        assert_eq!(backoff_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(10, base, max), max);
    }
}
