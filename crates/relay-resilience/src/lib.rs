//! Retry middleware and per-resource circuit breaker.
//!
//! Grounded on the teacher's `providers::circuit_breaker` module: a
//! wrapper type around a fallible operation, state guarded by a
//! `tokio::sync::Mutex`, and error classification by substring match
//! rather than typed error codes (the upstream operations this wraps —
//! SSH, database, chat HTTP — all surface their failures as strings).

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerStats, CircuitBreaker, CircuitOpenError, CircuitState};
pub use retry::{classify, Classification, RetryPolicy, RetryStats};
