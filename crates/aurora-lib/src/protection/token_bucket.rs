//! Lazily refilled token bucket
//!
//! The bucket never ticks on its own. Every operation takes the current
//! instant and refills by `elapsed * rate` first, capped at capacity.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(capacity: f64, rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            rate: rate.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Debit `cost` tokens if available. Costs that are not positive and
    /// finite are refused, so the balance never rises above capacity.
    pub fn try_consume(&mut self, cost: f64, now: Instant) -> bool {
        if !is_valid_cost(cost) {
            return false;
        }
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Credit back tokens from a debit that did not go through
    pub fn refund(&mut self, amount: f64) {
        if !is_valid_cost(amount) {
            return;
        }
        self.tokens = (self.tokens + amount).min(self.capacity);
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn is_full(&mut self, now: Instant) -> bool {
        self.available(now) >= self.capacity
    }

    /// Time until `cost` tokens exist, rounded up to the millisecond
    pub fn wait_time(&mut self, cost: f64, now: Instant) -> Duration {
        self.refill(now);
        let deficit = cost - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_millis((deficit / self.rate * 1000.0).ceil() as u64)
    }

    pub fn reset(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }
}

pub(crate) fn is_valid_cost(cost: f64) -> bool {
    cost.is_finite() && cost > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full_and_debits() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(5.0, 5.0, now);

        for _ in 0..5 {
            assert!(bucket.try_consume(1.0, now));
        }
        assert!(!bucket.try_consume(1.0, now));
        assert_eq!(bucket.available(now), 0.0);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 2.0, now);
        assert!(bucket.try_consume(10.0, now));

        let later = now + Duration::from_secs(2);
        assert_eq!(bucket.available(later), 4.0);

        let much_later = now + Duration::from_secs(3600);
        assert_eq!(bucket.available(much_later), 10.0);
        assert!(bucket.is_full(much_later));
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(3.0, 1.5, start);

        for step in 0..200u64 {
            let now = start + Duration::from_millis(step * 137);
            let cost = (step % 4) as f64;
            bucket.try_consume(cost, now);
            if step % 7 == 0 {
                bucket.refund(2.0);
            }
            let tokens = bucket.available(now);
            assert!((0.0..=3.0).contains(&tokens), "tokens {tokens} out of bounds");
        }
    }

    #[test]
    fn test_wait_time_rounds_up() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 3.0, now);
        assert!(bucket.try_consume(1.0, now));

        // one token at 3/s needs 333.33ms
        assert_eq!(bucket.wait_time(1.0, now), Duration::from_millis(334));
        assert_eq!(bucket.wait_time(0.0, now), Duration::ZERO);
    }

    #[test]
    fn test_rejects_negative_and_nan_costs() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(5.0, 5.0, now);

        for cost in [-5.0, 0.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(!bucket.try_consume(cost, now), "cost {cost} admitted");
        }
        bucket.refund(-3.0);
        bucket.refund(f64::NAN);
        assert_eq!(bucket.available(now), 5.0);

        let admitted = (0..10).filter(|_| bucket.try_consume(1.0, now)).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_refund_does_not_overflow() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 1.0, now);
        bucket.refund(5.0);
        assert_eq!(bucket.available(now), 2.0);
    }
}
