use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Emits a `Debug` impl that redacts named fields instead of deriving one,
/// so stray `{:?}` logging never leaks a shared secret or bot token.
/// Ported from the teacher's `config::schema` macro of the same name.
macro_rules! redact_debug {
    (@field $builder:ident, $self:ident, redact($field:ident)) => {
        $builder.field(
            stringify!($field),
            &if $self.$field.is_empty() {
                "[empty]"
            } else {
                "[REDACTED]"
            },
        );
    };
    (@fields $builder:ident, $self:ident, redact($field:ident), $($rest:tt)*) => {
        redact_debug!(@field $builder, $self, redact($field));
        redact_debug!(@fields $builder, $self, $($rest)*);
    };
    (@fields $builder:ident, $self:ident, $field:ident, $($rest:tt)*) => {
        $builder.field(stringify!($field), &$self.$field);
        redact_debug!(@fields $builder, $self, $($rest)*);
    };
    (@fields $builder:ident, $self:ident,) => {};
    ($struct_name:ident, $($fields:tt)*) => {
        impl std::fmt::Debug for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut builder = f.debug_struct(stringify!($struct_name));
                redact_debug!(@fields builder, self, $($fields)*);
                builder.finish()
            }
        }
    };
}

fn default_notify_port() -> u16 {
    8080
}

fn default_webhook_port() -> u16 {
    8081
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_ssh_port() -> u16 {
    22
}

/// Top-level configuration, loaded from a single TOML file (spec §6
/// "A configuration file enumerates servers and central settings").
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntryConfig>,
    pub chat: ChatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryTuning,
}

redact_debug!(Config, gateway, servers, chat, storage, retry);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,
    /// Overridden at runtime by the `SHARED_SECRET` environment variable
    /// when set (spec §6 "Environment variables recognised by the core").
    pub shared_secret: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("notify_port", &self.notify_port)
            .field("webhook_port", &self.webhook_port)
            .field(
                "shared_secret",
                &if self.shared_secret.is_empty() { "[empty]" } else { "[REDACTED]" },
            )
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Local,
    Remote,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerEntryConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
}

redact_debug!(
    ServerEntryConfig,
    id,
    kind,
    hostname,
    ssh_user,
    ssh_port,
    ssh_key_path,
);

#[derive(Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub telegram_token: String,
    pub chat_id: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

redact_debug!(ChatConfig, redact(telegram_token), chat_id, allow_from);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: default_db_dir() }
    }
}

impl StorageConfig {
    pub fn sessions_db_path(&self) -> PathBuf {
        self.dir.join("sessions.db")
    }

    pub fn dlq_db_path(&self) -> PathBuf {
        self.dir.join("dlq.db")
    }
}

/// Optional overrides for the retry/breaker defaults baked into
/// `relay-resilience`. Absent fields fall back to the policy constants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryTuning {
    #[serde(default)]
    pub dlq_retry_intervals_secs: Option<Vec<i64>>,
    #[serde(default)]
    pub dlq_max_attempts: Option<i64>,
    #[serde(default)]
    pub dlq_cleanup_after_days: Option<i64>,
    #[serde(default)]
    pub breaker_failure_threshold: Option<u32>,
    #[serde(default)]
    pub breaker_success_threshold: Option<u32>,
    #[serde(default)]
    pub breaker_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_debug_redacts_secret() {
        let gateway = GatewayConfig {
            notify_port: 8080,
            webhook_port: 8081,
            shared_secret: "topsecret".to_string(),
        };
        let rendered = format!("{gateway:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn server_entry_debug_reports_hostname_and_id() {
        let entry = ServerEntryConfig {
            id: "kr4".to_string(),
            kind: ServerKind::Remote,
            hostname: "kr4.example.com".to_string(),
            ssh_user: Some("deploy".to_string()),
            ssh_port: 22,
            ssh_key_path: Some("~/.ssh/id_ed25519".to_string()),
        };
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("kr4"));
        assert!(rendered.contains("kr4.example.com"));
    }
}
