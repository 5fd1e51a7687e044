use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use relay_core::{Server, ServerRegistry, ServerType};
use relay_resilience::{CircuitBreaker, RetryPolicy, RetryStats};
use tracing::{debug, warn};

use crate::errors::{SshError, SshResult};
use crate::pool::SshPool;

/// Shells a tmux `send-keys` invocation followed by an `Enter` keystroke,
/// matching the teacher's `TmuxTool::run_tmux` shape but without the
/// dedicated socket — local delivery talks to the operator's default
/// tmux server directly.
async fn local_send_keys(tmux_session: &str, command: &str) -> Result<()> {
    let output = tokio::process::Command::new("tmux")
        .args(["send-keys", "-t", tmux_session, command, "Enter"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("spawning local tmux")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tmux send-keys failed: {stderr}"));
    }
    Ok(())
}

fn remote_send_keys_command(tmux_session: &str, command: &str) -> String {
    let quoted = shell_escape::escape(command.into());
    format!("tmux send-keys -t {tmux_session} {quoted} Enter")
}

/// Delivers text into a named tmux session on a server, local or remote
/// (spec §4.6). Remote delivery is wrapped in a breaker guard and the
/// `ssh` retry policy; local delivery bypasses both, as there is no
/// network hop to protect against.
pub struct CommandExecutor {
    servers: std::sync::Arc<ServerRegistry>,
    pool: SshPool,
    breaker: CircuitBreaker,
    retry_stats: RetryStats,
    retry_policy: RetryPolicy,
}

impl CommandExecutor {
    /// Builds an executor with a `CircuitBreaker` tuned from configuration
    /// (spec §4.2's `failureThreshold` / `successThreshold` / `timeout`),
    /// falling back to `CircuitBreaker::with_defaults()`'s values when the
    /// caller has nothing to override.
    pub fn new(
        servers: std::sync::Arc<ServerRegistry>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            servers,
            pool: SshPool::new(),
            breaker,
            retry_stats: RetryStats::default(),
            retry_policy: RetryPolicy::ssh(),
        }
    }

    #[cfg(test)]
    fn with_default_breaker(servers: std::sync::Arc<ServerRegistry>) -> Self {
        Self::new(servers, CircuitBreaker::with_defaults())
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn execute(
        &self,
        server_id: &str,
        command: &str,
        tmux_session: &str,
    ) -> SshResult<()> {
        let server = self
            .servers
            .get(server_id)
            .await
            .ok_or_else(|| SshError::UnknownServer(server_id.to_string()))?;

        match server.server_type {
            ServerType::Local => {
                local_send_keys(tmux_session, command)
                    .await
                    .map_err(|e| SshError::Delivery {
                        server_id: server_id.to_string(),
                        source: e,
                    })
            }
            ServerType::Remote => self.execute_remote(&server, command, tmux_session).await,
        }
    }

    async fn execute_remote(
        &self,
        server: &Server,
        command: &str,
        tmux_session: &str,
    ) -> SshResult<()> {
        self.breaker.check(&server.id).await?;

        let remote_command = remote_send_keys_command(tmux_session, command);
        let result = relay_resilience::retry::execute_with_retry(
            &self.retry_stats,
            &self.retry_policy,
            || async {
                self.pool
                    .with_session(server, |session| {
                        let remote_command = remote_command.clone();
                        async move {
                            let output = session
                                .command("sh")
                                .arg("-c")
                                .raw_arg(&remote_command)
                                .output()
                                .await
                                .context("executing remote tmux send-keys")?;
                            if !output.status.success() {
                                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                                return Err(anyhow!("remote command failed: {stderr}"));
                            }
                            Ok(())
                        }
                    })
                    .await
                    .map_err(|e| e.to_string())
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.breaker.record_success(&server.id).await;
                Ok(())
            }
            Err(message) => {
                warn!(server_id = %server.id, error = %message, "ssh delivery failed, evicting client");
                self.pool.evict(&server.id).await;
                self.breaker.record_failure(&server.id).await;
                Err(SshError::Delivery {
                    server_id: server.id.clone(),
                    source: anyhow!(message),
                })
            }
        }
    }

    /// Best-effort kill of a named tmux session, used by the recovery
    /// manager. Absent sessions are a normal outcome, not an error
    /// (spec §4.9 "tolerating failure").
    pub async fn kill_session(&self, server_id: &str, tmux_session: &str) -> Result<()> {
        let server = self
            .servers
            .get(server_id)
            .await
            .ok_or_else(|| anyhow!("unknown server '{server_id}'"))?;
        match server.server_type {
            ServerType::Local => {
                let output = tokio::process::Command::new("tmux")
                    .args(["kill-session", "-t", tmux_session])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .output()
                    .await
                    .context("spawning local tmux kill-session")?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "tmux kill-session failed: {}",
                        String::from_utf8_lossy(&output.stderr)
                    ))
                }
            }
            ServerType::Remote => {
                self.pool
                    .with_session(&server, |session| async move {
                        let output = session
                            .command("tmux")
                            .args(["kill-session", "-t", tmux_session])
                            .output()
                            .await
                            .context("executing remote tmux kill-session")?;
                        if output.status.success() {
                            Ok(())
                        } else {
                            Err(anyhow!(
                                "tmux kill-session failed: {}",
                                String::from_utf8_lossy(&output.stderr)
                            ))
                        }
                    })
                    .await
            }
        }
    }

    /// Lists live tmux session names on `server_id`, for orphan detection
    /// (spec §4.9 "list tmux sessions on reachable servers").
    pub async fn list_sessions(&self, server_id: &str) -> Result<Vec<String>> {
        let server = self
            .servers
            .get(server_id)
            .await
            .ok_or_else(|| anyhow!("unknown server '{server_id}'"))?;
        let stdout = match server.server_type {
            ServerType::Local => {
                let output = tokio::process::Command::new("tmux")
                    .args(["list-sessions", "-F", "#{session_name}"])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .output()
                    .await
                    .context("spawning local tmux list-sessions")?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if stderr.contains("no server running") {
                        return Ok(Vec::new());
                    }
                    return Err(anyhow!("tmux list-sessions failed: {stderr}"));
                }
                String::from_utf8_lossy(&output.stdout).to_string()
            }
            ServerType::Remote => {
                self.pool
                    .with_session(&server, |session| async move {
                        let output = session
                            .command("tmux")
                            .args(["list-sessions", "-F", "#{session_name}"])
                            .output()
                            .await
                            .context("executing remote tmux list-sessions")?;
                        if !output.status.success() {
                            let stderr = String::from_utf8_lossy(&output.stderr);
                            if stderr.contains("no server running") {
                                return Ok(String::new());
                            }
                            return Err(anyhow!("tmux list-sessions failed: {stderr}"));
                        }
                        Ok(String::from_utf8_lossy(&output.stdout).to_string())
                    })
                    .await?
            }
        };
        Ok(stdout.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    pub async fn shutdown(&self) {
        debug!("shutting down ssh executor");
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Server;
    use std::sync::Arc;

    #[test]
    fn remote_command_single_quotes_embedded_text() {
        let cmd = remote_send_keys_command("tmux1", "echo 'hi there'");
        assert!(cmd.starts_with("tmux send-keys -t tmux1 "));
        assert!(cmd.ends_with(" Enter"));
        assert!(cmd.contains("echo"));
    }

    #[tokio::test]
    async fn execute_unknown_server_errors() {
        let servers = Arc::new(ServerRegistry::empty());
        let executor = CommandExecutor::with_default_breaker(servers);
        let err = executor.execute("ghost", "ls", "tmux1").await.unwrap_err();
        assert!(matches!(err, SshError::UnknownServer(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn local_server_routes_to_local_send_keys() {
        // Without a real tmux binary on PATH this exercises the error path,
        // but confirms local servers never touch the ssh pool or breaker.
        let servers = Arc::new(ServerRegistry::empty());
        servers.register(Server::local("kr4")).await;
        let executor = CommandExecutor::with_default_breaker(servers);
        let _ = executor.execute("kr4", "ls", "tmux1").await;
        let stats = executor.breaker().stats("kr4").await;
        assert_eq!(stats.total_operations, 0);
    }
}
