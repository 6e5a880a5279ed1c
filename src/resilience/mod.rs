//! # Resilience Primitives Module
//!
//! Admission control for the dispatch engine: a circuit breaker that isolates a
//! failing downstream, and a token-bucket rate limiter that bounds throughput.
//! Both are plain service objects; the coordinator owns one of each per
//! configured downstream and shares them across workers through `Arc`.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed / Open / HalfOpen fault isolator |
//! | [`rate_limiter`] | Token bucket with a background refiller |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Failures reached the threshold, requests fail fast
//! - **Half-Open**: The first check after the reset timeout probes the downstream
//!
//! ```rust
//! use nl2sql_runtime::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_max_failures(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new(config);
//!
//! if breaker.allow_request() {
//!     // Call the provider...
//!     breaker.record_success();
//! }
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use nl2sql_runtime::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = RateLimiterConfig::new()
//!     .with_capacity(100)
//!     .with_rate(10.0); // 10 permits per second
//! let limiter = RateLimiter::new(config);
//!
//! if limiter.try_acquire() {
//!     // Proceed with request...
//! }
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot};
