use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};

/// Error classification used to decide whether a failed attempt is worth
/// retrying. Mirrors the teacher's `CircuitBreakerProvider::is_transient`
/// substring-matching approach, extended with an explicit non-retryable
/// marker for callers that already know better than a string match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Persistent,
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "econnrefused",
    "connection reset",
    "econnreset",
    "timed out",
    "timeout",
    "host unreachable",
    "ehostunreach",
    "network unreachable",
    "broken pipe",
    "database is locked",
    "database is busy",
    "sqlite_busy",
    "sqlite_locked",
    "temporarily unavailable",
];

const PERSISTENT_PATTERNS: &[&str] = &[
    "authentication failed",
    "auth failed",
    "permission denied",
    "no such file or directory",
    "file not found",
    "invalid private key",
    "unauthorized",
];

/// Classify an error's diagnostic string. Unclassified errors default to
/// `Transient` (defensive) — see the Open Question in `SPEC_FULL.md`
/// §12 for why this stays a deliberately loose allow-list rather than a
/// strict whitelist.
pub fn classify(message: &str) -> Classification {
    let lower = message.to_lowercase();
    if PERSISTENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Classification::Persistent;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Classification::Transient;
    }
    Classification::Transient
}

/// A named backoff policy, per spec §4.1.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub const fn ssh() -> Self {
        Self {
            name: "ssh",
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(16000),
            backoff: 2.0,
            jitter: 0.10,
        }
    }

    pub const fn telegram() -> Self {
        Self {
            name: "telegram",
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            backoff: 2.0,
            jitter: 0.10,
        }
    }

    pub const fn database() -> Self {
        Self {
            name: "database",
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(5000),
            backoff: 2.0,
            jitter: 0.10,
        }
    }

    /// Delay before the given attempt (1-indexed), jitter sampled via the
    /// supplied `[-1.0, 1.0]` uniform sample (tests pass `0.0` for a
    /// deterministic sequence, per spec §8 law 8).
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        debug_assert!(attempt >= 1);
        let raw = self.base_delay.as_secs_f64() * self.backoff.powi(attempt as i32 - 1);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter_amount = capped * self.jitter * jitter_sample;
        let jittered = (capped + jitter_amount).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Running counters, exposed for diagnostics per spec §4.1.
#[derive(Default)]
pub struct RetryStats {
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
}

impl RetryStats {
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
    pub fn successful_retries(&self) -> u64 {
        self.successful_retries.load(Ordering::Relaxed)
    }
    pub fn failed_retries(&self) -> u64 {
        self.failed_retries.load(Ordering::Relaxed)
    }
}

/// Marker trait errors can implement to force non-retryable treatment
/// regardless of string classification (spec §4.1 "explicit non-retryable
/// marker"). `execute_with_retry` consults this before falling back to
/// `classify`, so a caller whose error type already knows it can't be
/// retried doesn't need to spell that out in the message text.
pub trait NonRetryableMarker {
    fn is_non_retryable(&self) -> bool {
        false
    }
}

/// Plain `String` errors (the shape most call sites collapse into before
/// retrying) carry no structured signal, so they always defer to
/// `classify`.
impl NonRetryableMarker for String {}

/// Execute `operation` under `policy`, retrying transient failures with
/// exponential backoff and jitter. `operation` is retried by calling the
/// factory closure again; the closure must be re-invocable (it typically
/// captures `Arc`-wrapped state).
pub async fn execute_with_retry<T, E, F, Fut>(
    stats: &RetryStats,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    E: fmt::Display + NonRetryableMarker,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    stats.successful_retries.fetch_add(1, Ordering::Relaxed);
                    info!(policy = policy.name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let message = err.to_string();
                let marked_non_retryable = err.is_non_retryable();
                let classification = classify(&message);
                let exhausted = attempt >= policy.max_attempts;
                if marked_non_retryable || classification == Classification::Persistent || exhausted {
                    if attempt > 1 {
                        stats.failed_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    error!(
                        policy = policy.name,
                        attempt,
                        error = %message,
                        "operation failed, not retrying further"
                    );
                    return Err(err);
                }

                stats.total_retries.fetch_add(1, Ordering::Relaxed);
                let jitter_sample = fastrand::f64() * 2.0 - 1.0;
                let delay = policy.delay_for(attempt, jitter_sample);
                warn!(
                    policy = policy.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn classifies_transient_errors() {
        assert_eq!(classify("connection refused"), Classification::Transient);
        assert_eq!(classify("ECONNREFUSED"), Classification::Transient);
        assert_eq!(classify("database is locked"), Classification::Transient);
        assert_eq!(classify("request timed out"), Classification::Transient);
    }

    #[test]
    fn classifies_persistent_errors() {
        assert_eq!(
            classify("authentication failed for user"),
            Classification::Persistent
        );
        assert_eq!(classify("Permission denied"), Classification::Persistent);
        assert_eq!(
            classify("No such file or directory"),
            Classification::Persistent
        );
    }

    #[test]
    fn unclassified_defaults_to_transient() {
        assert_eq!(classify("some unknown gremlin"), Classification::Transient);
    }

    #[test]
    fn backoff_law_zero_jitter() {
        let policy = RetryPolicy::ssh();
        let d1 = policy.delay_for(1, 0.0);
        let d2 = policy.delay_for(2, 0.0);
        let d3 = policy.delay_for(3, 0.0);
        assert_eq!(d1, Duration::from_millis(1000));
        assert_eq!(d2, Duration::from_millis(2000));
        assert_eq!(d3, Duration::from_millis(4000));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = RetryPolicy::ssh();
        let d = policy.delay_for(10, 0.0);
        assert_eq!(d, Duration::from_millis(16000));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let stats = RetryStats::default();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::ssh()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<&str, String> = execute_with_retry(&stats, &policy, move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("connection refused".to_string())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.successful_retries(), 1);
    }

    #[tokio::test]
    async fn persistent_error_aborts_immediately() {
        let stats = RetryStats::default();
        let policy = RetryPolicy::ssh();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), String> = execute_with_retry(&stats, &policy, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("authentication failed".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let stats = RetryStats::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::ssh()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), String> = execute_with_retry(&stats, &policy, move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("connection reset".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
