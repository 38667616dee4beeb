//! Call protection primitives
//!
//! - Circuit breakers that stop calling a failing dependency and retry after a timeout
//! - Token-bucket rate limiters with optional per-client sub-limits
//! - Sliding-window limiters for exact per-window quotas
//! - Name-keyed managers that construct both lazily

mod circuit_breaker;
mod rate_limiter;
mod sliding_window;
mod token_bucket;

pub use circuit_breaker::{
    CallPolicy, CircuitBreaker, CircuitBreakerManager, CircuitState, CircuitStats, Permit,
};
pub use rate_limiter::{
    preset, RateLimiter, RateLimiterManager, RateLimiterStats, PRESET_NAMES,
};
pub use sliding_window::{SlidingWindowRateLimiter, SlidingWindowStats};
pub use token_bucket::TokenBucket;
