//! Session recovery manager: periodic expired-session and orphaned-tmux
//! cleanup (spec §4.9).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Default, Serialize)]
pub struct RecoveryCounts {
    pub recovered: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct CleanupCounts {
    pub cleaned: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionHealth {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub expired_sessions: usize,
    pub orphaned_sessions: usize,
    pub healthy: bool,
}

/// Running totals kept for the lifetime of the process, independent of
/// any single sweep (spec §4.9 `getRecoveryStats`).
#[derive(Default)]
pub struct RecoveryStats {
    expired_recovered: AtomicU64,
    orphaned_cleaned: AtomicU64,
    last_recovery: AtomicI64,
}

#[derive(Debug, Serialize)]
pub struct RecoveryStatsView {
    pub expired_recovered: u64,
    pub orphaned_cleaned: u64,
    pub last_recovery: Option<DateTime<Utc>>,
}

impl RecoveryStats {
    fn record(&self, expired: u64, orphaned: u64) {
        self.expired_recovered.fetch_add(expired, Ordering::Relaxed);
        self.orphaned_cleaned.fetch_add(orphaned, Ordering::Relaxed);
        self.last_recovery.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn view(&self) -> RecoveryStatsView {
        let ts = self.last_recovery.load(Ordering::Relaxed);
        RecoveryStatsView {
            expired_recovered: self.expired_recovered.load(Ordering::Relaxed),
            orphaned_cleaned: self.orphaned_cleaned.load(Ordering::Relaxed),
            last_recovery: (ts != 0).then(|| DateTime::from_timestamp(ts, 0).unwrap_or_default()),
        }
    }
}

pub struct RecoveryManager {
    state: Arc<AppState>,
    pub stats: RecoveryStats,
}

impl RecoveryManager {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            stats: RecoveryStats::default(),
        }
    }

    pub async fn detect_expired_sessions(&self) -> anyhow::Result<Vec<relay_core::Session>> {
        Ok(self.state.sessions.detect_expired()?)
    }

    pub async fn recover_expired_sessions(&self) -> anyhow::Result<RecoveryCounts> {
        let expired = self.detect_expired_sessions().await?;
        let mut counts = RecoveryCounts::default();
        for session in expired {
            if let Err(e) = self
                .state
                .executor
                .kill_session(&session.server_id, &session.tmux_session)
                .await
            {
                warn!(session = %session.identifier(), error = %e, "kill-session failed during recovery (tolerated)");
            }
            match self.state.sessions.mark_expired(&session.id) {
                Ok(()) => counts.recovered += 1,
                Err(e) => {
                    error!(session = %session.identifier(), error = %e, "failed to mark session expired");
                    counts.failed += 1;
                }
            }
        }
        Ok(counts)
    }

    pub async fn detect_orphaned_sessions(&self) -> anyhow::Result<Vec<(String, String)>> {
        let known: HashSet<(String, String)> = self
            .state
            .sessions
            .get_all_sessions()?
            .into_iter()
            .map(|s| (s.server_id, s.tmux_session))
            .collect();

        let mut orphans = Vec::new();
        for server in self.state.servers.all().await {
            let live = match self.state.executor.list_sessions(&server.id).await {
                Ok(live) => live,
                Err(e) => {
                    warn!(server_id = %server.id, error = %e, "could not list tmux sessions, skipping for orphan detection");
                    continue;
                }
            };
            for tmux_session in live {
                if !known.contains(&(server.id.clone(), tmux_session.clone())) {
                    orphans.push((server.id.clone(), tmux_session));
                }
            }
        }
        Ok(orphans)
    }

    pub async fn cleanup_orphaned_sessions(&self) -> anyhow::Result<CleanupCounts> {
        let orphans = self.detect_orphaned_sessions().await?;
        let mut counts = CleanupCounts::default();
        for (server_id, tmux_session) in orphans {
            match self.state.executor.kill_session(&server_id, &tmux_session).await {
                Ok(()) => counts.cleaned += 1,
                Err(e) => {
                    warn!(server_id, tmux_session, error = %e, "failed to clean up orphaned tmux session");
                    counts.failed += 1;
                }
            }
        }
        Ok(counts)
    }

    pub async fn check_session_health(&self) -> anyhow::Result<SessionHealth> {
        let active = self.state.sessions.get_all_sessions()?.len();
        let expired = self.detect_expired_sessions().await?.len();
        let orphaned = self.detect_orphaned_sessions().await?.len();
        Ok(SessionHealth {
            total_sessions: active + expired,
            active_sessions: active,
            expired_sessions: expired,
            orphaned_sessions: orphaned,
            healthy: expired == 0 && orphaned == 0,
        })
    }

    pub async fn perform_full_recovery(&self) -> anyhow::Result<(RecoveryCounts, CleanupCounts)> {
        let recovered = self.recover_expired_sessions().await?;
        let cleaned = self.cleanup_orphaned_sessions().await?;
        self.stats.record(recovered.recovered, cleaned.cleaned);
        Ok((recovered, cleaned))
    }
}

/// Periodic sweep, cancellable the same way as the DLQ retry loop
/// (spec §9 "timer-driven state machines... cancellable from shutdown").
pub async fn run_recovery_loop(manager: Arc<RecoveryManager>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("recovery sweep cancelled");
                return;
            }
            _ = ticker.tick() => {
                match manager.perform_full_recovery().await {
                    Ok((recovered, cleaned)) => {
                        if recovered.recovered > 0 || cleaned.cleaned > 0 {
                            info!(recovered = recovered.recovered, cleaned = cleaned.cleaned, "recovery sweep completed");
                        }
                    }
                    Err(e) => error!(error = %e, "recovery sweep failed"),
                }
            }
        }
    }
}
