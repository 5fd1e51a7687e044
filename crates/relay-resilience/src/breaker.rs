use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Observable breaker state, per spec §3 "Circuit breaker state (per
/// server)". Unlike the teacher's `CircuitState`, which only serves a
/// single inner provider, this one is keyed per `server_id` — see
/// `CircuitBreaker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("circuit open for server '{server_id}', retry after {retry_after_secs}s")]
pub struct CircuitOpenError {
    pub server_id: String,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_failures: u32,
    pub total_operations: u64,
    pub success_rate: f64,
    pub last_failure_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    pub next_probe_at: Option<Instant>,
}

struct ServerEntry {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    consecutive_failures: u32,
    total_operations: u64,
    total_successes: u64,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    next_probe_at: Option<Instant>,
}

impl ServerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            total_operations: 0,
            total_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            next_probe_at: None,
        }
    }

    fn stats(&self) -> BreakerStats {
        let success_rate = if self.total_operations == 0 {
            1.0
        } else {
            self.total_successes as f64 / self.total_operations as f64
        };
        BreakerStats {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            consecutive_failures: self.consecutive_failures,
            total_operations: self.total_operations,
            success_rate,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            next_probe_at: self.next_probe_at,
        }
    }
}

/// Per-server three-state circuit breaker (spec §4.2). Mutations for a
/// single server are sequenced by a `Mutex` per entry; different servers
/// never contend with each other, matching the "fully concurrent across
/// servers" guarantee in spec §5.
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    servers: Mutex<HashMap<String, ServerEntry>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(5, 2, Duration::from_secs(30))
    }

    /// Check whether an operation against `server_id` may proceed, rolling
    /// an elapsed `Open` window into `HalfOpen` as a side effect.
    pub async fn check(&self, server_id: &str) -> Result<(), CircuitOpenError> {
        let mut servers = self.servers.lock().await;
        let entry = servers.entry(server_id.to_string()).or_insert_with(ServerEntry::new);

        if entry.state == CircuitState::Open {
            let ready = entry
                .next_probe_at
                .map(|t| Instant::now() >= t)
                .unwrap_or(false);
            if ready {
                info!(server_id, "circuit breaker Open -> HalfOpen (probe window elapsed)");
                entry.state = CircuitState::HalfOpen;
                entry.success_count = 0;
            } else {
                let retry_after_secs = entry
                    .next_probe_at
                    .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(self.timeout.as_secs());
                return Err(CircuitOpenError {
                    server_id: server_id.to_string(),
                    retry_after_secs,
                });
            }
        }

        Ok(())
    }

    pub async fn record_success(&self, server_id: &str) {
        let mut servers = self.servers.lock().await;
        let entry = servers.entry(server_id.to_string()).or_insert_with(ServerEntry::new);
        entry.total_operations += 1;
        entry.total_successes += 1;
        entry.last_success_at = Some(Instant::now());
        entry.failure_count = entry.failure_count.saturating_sub(1);
        entry.consecutive_failures = 0;

        if entry.state == CircuitState::HalfOpen {
            entry.success_count += 1;
            if entry.success_count >= self.success_threshold {
                info!(server_id, "circuit breaker HalfOpen -> Closed");
                entry.state = CircuitState::Closed;
                entry.failure_count = 0;
                entry.success_count = 0;
                entry.next_probe_at = None;
            }
        }
    }

    pub async fn record_failure(&self, server_id: &str) {
        let mut servers = self.servers.lock().await;
        let entry = servers.entry(server_id.to_string()).or_insert_with(ServerEntry::new);
        entry.total_operations += 1;
        entry.last_failure_at = Some(Instant::now());
        entry.failure_count += 1;
        entry.consecutive_failures += 1;

        match entry.state {
            CircuitState::Closed => {
                if entry.consecutive_failures >= self.failure_threshold {
                    warn!(
                        server_id,
                        consecutive_failures = entry.consecutive_failures,
                        "circuit breaker Closed -> Open"
                    );
                    entry.state = CircuitState::Open;
                    entry.next_probe_at = Some(Instant::now() + self.timeout);
                }
            }
            CircuitState::HalfOpen => {
                warn!(server_id, "circuit breaker probe failed: HalfOpen -> Open");
                entry.state = CircuitState::Open;
                entry.success_count = 0;
                entry.next_probe_at = Some(Instant::now() + self.timeout);
            }
            CircuitState::Open => {}
        }
    }

    pub async fn stats(&self, server_id: &str) -> BreakerStats {
        let mut servers = self.servers.lock().await;
        servers
            .entry(server_id.to_string())
            .or_insert_with(ServerEntry::new)
            .stats()
    }

    /// Operator-initiated reset (spec §4.2 "Reset").
    pub async fn reset(&self, server_id: &str) {
        let mut servers = self.servers.lock().await;
        servers.insert(server_id.to_string(), ServerEntry::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_allows_operations() {
        let breaker = CircuitBreaker::new(5, 2, Duration::from_secs(30));
        assert!(breaker.check("kr4").await.is_ok());
    }

    #[tokio::test]
    async fn trips_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, 2, Duration::from_secs(30));
        for _ in 0..3 {
            breaker.record_failure("kr4").await;
        }
        let result = breaker.check("kr4").await;
        assert!(result.is_err());
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_never_trips() {
        let breaker = CircuitBreaker::new(3, 2, Duration::from_secs(30));
        for _ in 0..10 {
            breaker.record_success("kr4").await;
        }
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, 2, Duration::from_secs(30));
        breaker.record_failure("kr4").await;
        breaker.record_failure("kr4").await;
        breaker.record_success("kr4").await;
        breaker.record_failure("kr4").await;
        breaker.record_failure("kr4").await;
        // Only 2 consecutive failures since the reset, threshold is 3.
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_after_timeout_then_closes_on_successes() {
        let breaker = CircuitBreaker::new(2, 2, Duration::from_millis(10));
        breaker.record_failure("kr4").await;
        breaker.record_failure("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.check("kr4").await.is_ok());
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::HalfOpen);

        breaker.record_success("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::HalfOpen);
        breaker.record_success("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_reschedules_probe() {
        let breaker = CircuitBreaker::new(2, 2, Duration::from_millis(10));
        breaker.record_failure("kr4").await;
        breaker.record_failure("kr4").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.check("kr4").await.is_ok());

        breaker.record_failure("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Open);
        assert!(breaker.check("kr4").await.is_err());
    }

    #[tokio::test]
    async fn servers_are_independent() {
        let breaker = CircuitBreaker::new(1, 2, Duration::from_secs(30));
        breaker.record_failure("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Open);
        assert_eq!(breaker.stats("other").await.state, CircuitState::Closed);
        assert!(breaker.check("other").await.is_ok());
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let breaker = CircuitBreaker::new(1, 2, Duration::from_secs(30));
        breaker.record_failure("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Open);
        breaker.reset("kr4").await;
        assert_eq!(breaker.stats("kr4").await.state, CircuitState::Closed);
        assert!(breaker.check("kr4").await.is_ok());
    }
}
