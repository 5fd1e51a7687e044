use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use relay_core::Server;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

struct PoolEntry {
    session: Arc<Session>,
    last_used: Instant,
}

/// At most one persistent SSH client per server (spec §4.6). Acquisition
/// health-probes an existing client with a trivial command before reuse
/// and discards it on any failure; a fresh connection is opened on next
/// use. Mirrors the teacher's one-socket-per-session tmux pattern, scaled
/// up to a real network client instead of a local subprocess.
pub struct SshPool {
    clients: Mutex<HashMap<String, PoolEntry>>,
}

impl Default for SshPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SshPool {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn open_session(server: &Server) -> Result<Session> {
        let user = server
            .ssh_user
            .as_deref()
            .context("remote server missing ssh_user")?;
        let port = server.ssh_port.unwrap_or(22);
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.connect_timeout(CONNECT_TIMEOUT);
        builder.port(port);
        if let Some(key_path) = &server.ssh_key_path {
            let expanded = shellexpand::tilde(key_path).into_owned();
            builder.keyfile(expanded);
        }
        let destination = format!("{user}@{}", server.hostname);
        builder
            .connect(&destination)
            .await
            .with_context(|| format!("connecting to '{destination}'"))
    }

    async fn probe(session: &Session) -> bool {
        match session.command("echo").arg("ping").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    /// Returns a healthy session for `server`, opening or replacing one
    /// as needed. The caller borrows it only for the duration of one
    /// command; the pool keeps ownership between calls.
    pub async fn acquire(&self, server: &Server) -> Result<()> {
        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get(&server.id) {
            if Self::probe(&entry.session).await {
                return Ok(());
            }
            debug!(server_id = %server.id, "pooled ssh client failed health probe, discarding");
            clients.remove(&server.id);
        }
        let session = Self::open_session(server).await?;
        clients.insert(
            server.id.clone(),
            PoolEntry {
                session: Arc::new(session),
                last_used: Instant::now(),
            },
        );
        Ok(())
    }

    pub async fn with_session<F, Fut, T>(&self, server: &Server, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.acquire(server).await?;
        let session = {
            let mut clients = self.clients.lock().await;
            let entry = clients
                .get_mut(&server.id)
                .context("ssh client vanished between acquire and use")?;
            entry.last_used = Instant::now();
            entry.session.clone()
        };
        f(session).await
    }

    /// Drops the pooled client for `server_id` so the next acquisition
    /// opens a fresh connection. Called on execution failure (spec §4.6).
    pub async fn evict(&self, server_id: &str) {
        if self.clients.lock().await.remove(server_id).is_some() {
            warn!(server_id, "evicted ssh client after failure");
        }
    }

    /// Disposes of all clients concurrently, for graceful shutdown.
    pub async fn shutdown(&self) {
        let mut clients = self.clients.lock().await;
        let count = clients.len();
        clients.clear();
        debug!(count, "ssh pool shut down, all clients disposed");
    }
}
