use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Spec §3 "Server entry". `type` is `local` or `remote`; SSH parameters
/// are only meaningful for `remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct Server {
    pub id: String,
    pub server_type: ServerType,
    pub hostname: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_key_path: Option<String>,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Server {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_type: ServerType::Local,
            hostname: "localhost".to_string(),
            ssh_user: None,
            ssh_port: None,
            ssh_key_path: None,
            status: "unknown".to_string(),
            last_seen: None,
        }
    }
}

/// In-memory catalogue of known agents, loaded once from configuration
/// (spec §4.5). Status fields are the only runtime-mutable part; identity
/// and SSH parameters are fixed at load time. A `register` hook exists for
/// dynamic additions in tests, matching the teacher's
/// `ChannelManager::with_channels` test-only constructor pattern.
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Server>>,
}

impl ServerRegistry {
    pub fn new(servers: Vec<Server>) -> Self {
        let map = servers.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            servers: RwLock::new(map),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub async fn register(&self, server: Server) {
        self.servers.write().await.insert(server.id.clone(), server);
    }

    pub async fn get(&self, id: &str) -> Option<Server> {
        self.servers.read().await.get(id).cloned()
    }

    pub async fn has(&self, id: &str) -> bool {
        self.servers.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<Server> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn by_type(&self, server_type: ServerType) -> Vec<Server> {
        self.servers
            .read()
            .await
            .values()
            .filter(|s| s.server_type == server_type)
            .cloned()
            .collect()
    }

    pub async fn update_status(&self, id: &str, status: &str, last_seen: DateTime<Utc>) {
        if let Some(server) = self.servers.write().await.get_mut(id) {
            server.status = status.to_string();
            server.last_seen = Some(last_seen);
        }
    }

    pub async fn count(&self) -> usize {
        self.servers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = ServerRegistry::empty();
        registry.register(Server::local("kr4")).await;
        assert!(registry.has("kr4").await);
        assert!(!registry.has("missing").await);
    }

    #[tokio::test]
    async fn update_status_marks_liveness() {
        let registry = ServerRegistry::empty();
        registry.register(Server::local("kr4")).await;
        let now = Utc::now();
        registry.update_status("kr4", "active", now).await;
        let server = registry.get("kr4").await.unwrap();
        assert_eq!(server.status, "active");
        assert_eq!(server.last_seen, Some(now));
    }

    #[tokio::test]
    async fn by_type_filters() {
        let registry = ServerRegistry::new(vec![
            Server::local("local1"),
            Server {
                server_type: ServerType::Remote,
                ..Server::local("remote1")
            },
        ]);
        let locals = registry.by_type(ServerType::Local).await;
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].id, "local1");
    }
}
