//! Continuous-refill token bucket.

use std::time::Duration;
use tokio::time::Instant;

/// A token bucket holding up to `burst` tokens, refilled at `rate` tokens per second.
///
/// The bucket itself is not synchronized; owners wrap it in a lock. All methods take
/// the observation time explicitly so the arithmetic can be driven by any clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Tokens regenerated per second
    rate: f64,
    /// Maximum number of tokens
    burst: f64,
    /// Last time the bucket state was observed
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a fully charged bucket.
    pub fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            rate,
            burst,
            last_refill: now,
        }
    }

    /// Credit tokens for the time elapsed since the last refill, saturating at `burst`.
    ///
    /// Observations older than `last_refill` credit nothing and leave the timestamp alone.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = refill_tokens(self.tokens, elapsed, self.rate, self.burst);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        take_token(&mut self.tokens)
    }

    /// Time until one token will be available, without consuming anything.
    pub fn delay_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        delay_for_token(self.tokens, self.rate)
    }

    /// Apply new policy parameters in place, keeping accumulated credit.
    ///
    /// Credit is brought up to date under the old rate first and clamped to the new burst.
    pub fn set_limits(&mut self, rate: f64, burst: f64, now: Instant) {
        self.refill(now);
        self.rate = rate;
        self.burst = burst;
        self.tokens = self.tokens.min(burst);
    }

    /// Current token count (as of the last refill).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Last time the bucket was observed.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Mark the bucket as observed at `now` without changing its balance.
    pub fn touch(&mut self, now: Instant) {
        self.refill(now);
    }
}

/// Saturating refill: `min(burst, tokens + elapsed_secs * rate)`.
pub fn refill_tokens(tokens: f64, elapsed_secs: f64, rate: f64, burst: f64) -> f64 {
    (tokens + elapsed_secs.max(0.0) * rate).min(burst)
}

/// Consume one token if `tokens >= 1`.
pub fn take_token(tokens: &mut f64) -> bool {
    if *tokens >= 1.0 {
        *tokens -= 1.0;
        true
    } else {
        false
    }
}

/// Time until a balance of `tokens` reaches one whole token at `rate`.
pub fn delay_for_token(tokens: f64, rate: f64) -> Duration {
    if tokens >= 1.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64((1.0 - tokens) / rate)
    }
}

/// Render a wait as a `Retry-After` value: whole seconds, rounded up, at least 1.
pub fn retry_after_secs(delay: Duration) -> u64 {
    (delay.as_secs_f64().ceil() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = TokenBucket::new(2.0, 10.0, Instant::now());
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[test]
    fn test_instantaneous_calls_allow_exactly_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 10.0, now);

        let allowed = (0..25).filter(|_| bucket.try_take(now)).count();
        assert_eq!(allowed, 10);
        assert!(!bucket.try_take(now));
    }

    #[test]
    fn test_refill_saturates_at_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(5.0, 3.0, now);
        assert!(bucket.try_take(now));

        bucket.refill(now + Duration::from_secs(3600));
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn test_refill_after_one_interval_allows_again() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(0.5, 1.0, now);
        assert!(bucket.try_take(now));
        assert!(!bucket.clone().try_take(now + Duration::from_millis(1900)));

        // 1/rate = 2s after the first take
        assert!(bucket.try_take(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_tokens_non_decreasing_between_takes() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 4.0, now);
        for _ in 0..4 {
            bucket.try_take(now);
        }

        let mut previous = bucket.tokens();
        for ms in (0..6000).step_by(250) {
            bucket.refill(now + Duration::from_millis(ms));
            assert!(bucket.tokens() >= previous);
            assert!(bucket.tokens() <= 4.0);
            previous = bucket.tokens();
        }
    }

    #[test]
    fn test_stale_observation_does_not_rewind() {
        let now = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::new(1.0, 2.0, now);
        bucket.refill(now - Duration::from_secs(5));
        assert_eq!(bucket.last_refill(), now);
        assert_eq!(bucket.tokens(), 2.0);
    }

    #[test]
    fn test_delay_does_not_consume() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 1.0, now);
        assert!(bucket.try_take(now));

        let delay = bucket.delay_until_available(now);
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(bucket.tokens(), 0.0);
        assert_eq!(bucket.delay_until_available(now), delay);
    }

    #[test]
    fn test_set_limits_clamps_and_keeps_credit() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 10.0, now);
        bucket.try_take(now);
        bucket.set_limits(1.0, 4.0, now);
        assert_eq!(bucket.tokens(), 4.0);

        bucket.set_limits(3.0, 20.0, now);
        assert_eq!(bucket.tokens(), 4.0);
        assert_eq!(bucket.rate(), 3.0);
        assert_eq!(bucket.burst(), 20.0);
    }

    #[test]
    fn test_retry_after_rounds_up_with_floor_of_one() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(5)), 5);
    }

    #[test]
    fn test_free_functions() {
        assert_eq!(refill_tokens(1.0, 2.0, 0.5, 5.0), 2.0);
        assert_eq!(refill_tokens(1.0, -3.0, 0.5, 5.0), 1.0);

        let mut tokens = 0.75;
        assert!(!take_token(&mut tokens));
        assert_eq!(tokens, 0.75);
        assert_eq!(delay_for_token(0.75, 0.25), Duration::from_secs(1));
    }
}
