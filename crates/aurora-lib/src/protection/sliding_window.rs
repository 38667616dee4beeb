//! Sliding-window rate limiter
//!
//! Admits at most `max_requests` within any trailing window. Unlike the
//! token bucket there is no burst credit: the count resets only as old
//! admissions age out.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::error::RateLimitError;

#[derive(Debug, Clone, Serialize)]
pub struct SlidingWindowStats {
    pub name: String,
    pub max_requests: usize,
    pub window_ms: u64,
    pub remaining: usize,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct WindowState {
    admitted: VecDeque<Instant>,
    accepted: u64,
    rejected: u64,
}

pub struct SlidingWindowRateLimiter {
    name: String,
    max_requests: usize,
    window: Duration,
    clock: SharedClock,
    state: Mutex<WindowState>,
}

impl SlidingWindowRateLimiter {
    pub fn new(name: impl Into<String>, max_requests: usize, window: Duration) -> Self {
        Self::with_clock(name, max_requests, window, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        max_requests: usize,
        window: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
            clock,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn evict(&self, state: &mut WindowState, now: Instant) {
        while let Some(&oldest) = state.admitted.front() {
            if now.saturating_duration_since(oldest) < self.window {
                break;
            }
            state.admitted.pop_front();
        }
    }

    /// Admit one request, or report when the oldest admission leaves the window
    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);

        if state.admitted.len() < self.max_requests {
            state.admitted.push_back(now);
            state.accepted += 1;
            return Ok(());
        }

        state.rejected += 1;
        let retry_after = state
            .admitted
            .front()
            .map(|&oldest| self.window.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or(self.window);
        debug!(
            limiter = %self.name,
            retry_after_ms = retry_after.as_millis() as u64,
            "Sliding window full"
        );
        Err(RateLimitError::Exceeded {
            limiter: self.name.clone(),
            client: None,
            retry_after,
        })
    }

    pub fn acquire(&self) -> bool {
        self.try_acquire().is_ok()
    }

    pub fn remaining(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);
        self.max_requests.saturating_sub(state.admitted.len())
    }

    pub fn reset(&self) {
        *self.state.lock() = WindowState::default();
    }

    pub fn stats(&self) -> SlidingWindowStats {
        let remaining = self.remaining();
        let state = self.state.lock();
        SlidingWindowStats {
            name: self.name.clone(),
            max_requests: self.max_requests,
            window_ms: self.window.as_millis() as u64,
            remaining,
            accepted: state.accepted,
            rejected: state.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn window(max: usize, ms: u64) -> (SlidingWindowRateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter =
            SlidingWindowRateLimiter::with_clock("search", max, Duration::from_millis(ms), Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_admits_up_to_max_in_window() {
        let (limiter, _clock) = window(3, 1000);
        assert_eq!((0..5).filter(|_| limiter.acquire()).count(), 3);
        assert_eq!(limiter.remaining(), 0);

        let stats = limiter.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn test_old_requests_age_out_one_by_one() {
        let (limiter, clock) = window(2, 1000);
        assert!(limiter.acquire());
        clock.advance_ms(400);
        assert!(limiter.acquire());

        let err = limiter.try_acquire().unwrap_err();
        assert_eq!(err.retry_after(), Duration::from_millis(600));

        clock.advance_ms(600);
        assert_eq!(limiter.remaining(), 1);
        assert!(limiter.acquire());
        assert!(!limiter.acquire());
    }

    #[test]
    fn test_reset_clears_window() {
        let (limiter, _clock) = window(1, 60_000);
        assert!(limiter.acquire());
        assert!(!limiter.acquire());
        limiter.reset();
        assert!(limiter.acquire());
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let (limiter, _clock) = window(0, 1000);
        let err = limiter.try_acquire().unwrap_err();
        assert_eq!(err.retry_after(), Duration::from_millis(1000));
    }
}
