//! Token bucket pacing for connect attempts

use std::time::{Duration, Instant};

/// Token bucket rate limiter; a rate of 0 means unlimited
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    last_refill: Instant,
    tokens: f64,
    max_tokens: f64,
}

impl RateLimiter {
    pub fn new(per_second: u64) -> Self {
        Self {
            rate: per_second,
            last_refill: Instant::now(),
            tokens: per_second as f64,
            max_tokens: per_second as f64,
        }
    }

    /// Take a token if one is available
    pub fn try_acquire(&mut self) -> bool {
        if self.rate == 0 {
            return true;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let tokens_to_add = elapsed * self.rate as f64;
        if tokens_to_add.is_finite() && tokens_to_add >= 0.0 {
            self.tokens = (self.tokens + tokens_to_add).min(self.max_tokens);
        }
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Delay until the next token becomes available
    pub fn delay_until_next(&self) -> Duration {
        if self.rate == 0 || self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        let delay_secs = (1.0 - self.tokens) / self.rate as f64;
        if delay_secs.is_finite() && delay_secs >= 0.0 {
            Duration::from_secs_f64(delay_secs.min(1.0))
        } else {
            Duration::from_millis(1)
        }
    }

    /// Wait for and take a token
    pub async fn acquire(&mut self) {
        while !self.try_acquire() {
            tokio::time::sleep(self.delay_until_next().max(Duration::from_micros(100))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_drains_then_refuses() {
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.delay_until_next() > Duration::ZERO);
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        let mut limiter = RateLimiter::new(0);
        for _ in 0..10_000 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.delay_until_next(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let mut limiter = RateLimiter::new(100);
        for _ in 0..100 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
