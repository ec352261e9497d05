use std::time::{Duration, Instant};

use crate::config::TierLimit;

/// Result of a single consume attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Tokens left after this attempt
    pub remaining: f64,
    /// Zero when allowed, otherwise the wait until one token is available
    pub retry_after: Duration,
}

/// A single identity's continuously refilling budget.
///
/// Refill is computed lazily on each consume, so an idle bucket costs nothing.
/// `tokens` stays within `0..=capacity` across every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    requests_per_unit: f64,
    unit_secs: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket for the given tier limit
    pub fn new(limit: &TierLimit, now: Instant) -> Self {
        let capacity = f64::from(limit.burst);
        Self {
            capacity,
            requests_per_unit: f64::from(limit.requests_per_unit),
            unit_secs: limit.unit.to_seconds() as f64,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Take one token if available.
    pub fn try_consume(&mut self, now: Instant) -> ConsumeOutcome {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            ConsumeOutcome {
                allowed: true,
                remaining: self.tokens,
                retry_after: Duration::ZERO,
            }
        } else {
            ConsumeOutcome {
                allowed: false,
                remaining: self.tokens,
                retry_after: self.time_until(1.0),
            }
        }
    }

    /// Time until the bucket is back at capacity, as of the last refill
    pub fn time_to_full(&self) -> Duration {
        self.time_until(self.capacity)
    }

    fn refill(&mut self, now: Instant) {
        // A stale instant must not rewind `last_refill`, or the same interval
        // would be credited twice.
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        // Multiply before dividing so whole-token boundaries come out exact.
        let earned = elapsed * self.requests_per_unit / self.unit_secs;
        self.tokens = (self.tokens + earned).min(self.capacity);
        self.last_refill = now;
    }

    fn time_until(&self, target: f64) -> Duration {
        let deficit = target - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(deficit * self.unit_secs / self.requests_per_unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Unit;

    fn limit(burst: u32, requests_per_unit: u32) -> TierLimit {
        TierLimit {
            burst,
            requests_per_unit,
            unit: Unit::Minute,
            window_label: "minute".to_string(),
        }
    }

    #[test]
    fn test_fresh_bucket_allows_full_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&limit(2, 3), now);

        assert!(bucket.try_consume(now).allowed);
        assert!(bucket.try_consume(now).allowed);

        let denied = bucket.try_consume(now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0.0);
        // 3 per minute => one token every 20 seconds
        assert_eq!(denied.retry_after, Duration::from_secs(20));
    }

    #[test]
    fn test_refill_is_exact_on_token_boundary() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(5, 10), start);
        for _ in 0..5 {
            assert!(bucket.try_consume(start).allowed);
        }
        assert!(!bucket.try_consume(start).allowed);

        let later = start + Duration::from_secs(6);
        let outcome = bucket.try_consume(later);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0.0);
    }

    #[test]
    fn test_partial_refill_is_not_enough() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(1, 10), start);
        assert!(bucket.try_consume(start).allowed);

        let outcome = bucket.try_consume(start + Duration::from_secs(3));
        assert!(!outcome.allowed);
        assert!((outcome.remaining - 0.5).abs() < 1e-9);
        assert_eq!(outcome.retry_after, Duration::from_secs(3));
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(5, 10), start);
        bucket.try_consume(start);

        let outcome = bucket.try_consume(start + Duration::from_secs(3600));
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 4.0);
        assert!(bucket.tokens() <= bucket.capacity());
    }

    #[test]
    fn test_capacity_bound_over_mixed_sequence() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(3, 30), start);
        let mut now = start;

        for step in 0..200u64 {
            now += Duration::from_millis((step * 37) % 5_000);
            bucket.try_consume(now);
            assert!(bucket.tokens() >= 0.0);
            assert!(bucket.tokens() <= bucket.capacity());
        }
    }

    #[test]
    fn test_time_to_full() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(5, 10), start);
        assert_eq!(bucket.time_to_full(), Duration::ZERO);

        bucket.try_consume(start);
        bucket.try_consume(start);
        assert_eq!(bucket.time_to_full(), Duration::from_secs(12));
    }

    #[test]
    fn test_clock_going_backwards_does_not_drain() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::new(&limit(2, 3), start);

        let outcome = bucket.try_consume(start - Duration::from_secs(5));
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 1.0);
    }

    #[test]
    fn test_out_of_order_instant_is_not_credited_twice() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let mut bucket = TokenBucket::new(
            &TierLimit {
                burst: 1,
                requests_per_unit: 60,
                unit: Unit::Minute,
                window_label: "minute".to_string(),
            },
            start,
        );

        let allowed = [start, later, start, later]
            .into_iter()
            .filter(|now| bucket.try_consume(*now).allowed)
            .count();

        // One token at start plus one earned over the second.
        assert_eq!(allowed, 2);
        assert_eq!(bucket.tokens(), 0.0);
    }
}
