use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};

const TOKEN_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SESSION_TTL_SECS: i64 = 24 * 3600;

static IDENTIFIER_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+:\d+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "expired" => Self::Expired,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub server_id: String,
    pub server_number: i64,
    pub token: String,
    pub project: String,
    pub tmux_session: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub metadata: Value,
}

impl Session {
    /// Human-addressable identifier, `serverId:serverNumber`.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.server_id, self.server_number)
    }
}

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let created_at: String = row.get("created_at")?;
    let expires_at: String = row.get("expires_at")?;
    let metadata_raw: String = row.get("metadata")?;
    let status: String = row.get("status")?;
    Ok(Session {
        id: row.get("id")?,
        server_id: row.get("server_id")?,
        server_number: row.get("server_number")?,
        token: row.get("token")?,
        project: row.get("project")?,
        tmux_session: row.get("tmux_session")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .unwrap()
            .with_timezone(&Utc),
        status: SessionStatus::parse(&status),
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(Value::Null),
    })
}

/// Ordered, indexed SQLite-backed session store (spec §4.4).
///
/// Mirrors the teacher's `MemoryDB`: a fresh `Connection` is opened per
/// call with WAL pragmas applied on connect, rather than holding one
/// connection behind a mutex for the process lifetime. WAL mode is what
/// makes "multiple readers, single writer" (spec §5) actually hold.
pub struct SessionRegistry {
    db_path: PathBuf,
}

impl SessionRegistry {
    pub fn open(db_path: impl AsRef<Path>) -> CoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::Internal(e.into()))?;
            }
        }
        let registry = Self { db_path };
        registry.ensure_schema()?;
        Ok(registry)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA cache_size=-2000;
             PRAGMA wal_autocheckpoint=1000;",
        )?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                server_number INTEGER NOT NULL,
                token TEXT NOT NULL UNIQUE,
                project TEXT NOT NULL,
                tmux_session TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_server_number
                ON sessions(server_id, server_number);
            CREATE INDEX IF NOT EXISTS idx_sessions_server_id ON sessions(server_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);",
        )?;
        Ok(())
    }

    fn generate_token(conn: &Connection) -> rusqlite::Result<String> {
        loop {
            let token: String = (0..8)
                .map(|_| {
                    let idx = fastrand::usize(..TOKEN_CHARS.len());
                    TOKEN_CHARS[idx] as char
                })
                .collect();
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE token = ?1",
                    params![token],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(token);
            }
        }
    }

    /// Create or update a session for `(server_id, tmux_session)`, per
    /// spec §4.4 `createSession`. `metadata` carries the opaque
    /// conversation context (user question, agent response, etc).
    pub fn create_session(
        &self,
        server_id: &str,
        tmux_session: &str,
        project: &str,
        metadata: &Value,
    ) -> CoreResult<Session> {
        let conn = self.connect()?;
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let new_expiry = now + ChronoDuration::seconds(SESSION_TTL_SECS);
        let metadata_str = serde_json::to_string(metadata).map_err(|e| CoreError::Internal(e.into()))?;

        let existing = conn
            .query_row(
                "SELECT * FROM sessions WHERE server_id = ?1 AND tmux_session = ?2
                 AND status = 'active' AND expires_at > ?3
                 ORDER BY created_at DESC LIMIT 1",
                params![server_id, tmux_session, now_str],
                row_to_session,
            )
            .optional()?;

        if let Some(mut session) = existing {
            conn.execute(
                "UPDATE sessions SET project = ?1, metadata = ?2, expires_at = ?3 WHERE id = ?4",
                params![project, metadata_str, new_expiry.to_rfc3339(), session.id],
            )?;
            session.project = project.to_string();
            session.metadata = metadata.clone();
            session.expires_at = new_expiry;
            debug!(server_id, tmux_session, session_id = %session.id, "session updated (renewed)");
            return Ok(session);
        }

        let next_number: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(server_number), 0) + 1 FROM sessions WHERE server_id = ?1",
                params![server_id],
                |r| r.get(0),
            )
            .unwrap_or(1);
        let token = Self::generate_token(&conn)?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO sessions
                (id, server_id, server_number, token, project, tmux_session,
                 created_at, expires_at, status, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9)",
            params![
                id,
                server_id,
                next_number,
                token,
                project,
                tmux_session,
                now_str,
                new_expiry.to_rfc3339(),
                metadata_str,
            ],
        )?;

        debug!(server_id, server_number = next_number, %token, "session created");

        Ok(Session {
            id,
            server_id: server_id.to_string(),
            server_number: next_number,
            token,
            project: project.to_string(),
            tmux_session: tmux_session.to_string(),
            created_at: now,
            expires_at: new_expiry,
            status: SessionStatus::Active,
            metadata: metadata.clone(),
        })
    }

    /// Opportunistic sweep of expired rows, run before every lookup (spec
    /// §9 open question: a best-effort complement to the recovery
    /// manager's periodic sweep, not a substitute for it).
    fn sweep_expired(conn: &Connection) -> rusqlite::Result<usize> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE sessions SET status = 'expired' WHERE status = 'active' AND expires_at < ?1",
            params![now],
        )
    }

    /// Resolve an identifier (either `serverId:serverNumber` or an
    /// 8-char token) to an active, non-expired session (spec §4.4
    /// `findSession`).
    pub fn find_session(&self, identifier: &str) -> CoreResult<Option<Session>> {
        let conn = self.connect()?;
        Self::sweep_expired(&conn)?;
        let now = Utc::now().to_rfc3339();

        let session = if IDENTIFIER_PAIR.is_match(identifier) {
            let (server_id, number_str) = identifier.split_once(':').unwrap();
            let server_number: i64 = number_str.parse().unwrap_or(-1);
            conn.query_row(
                "SELECT * FROM sessions WHERE server_id = ?1 AND server_number = ?2
                 AND status = 'active' AND expires_at > ?3",
                params![server_id, server_number, now],
                row_to_session,
            )
            .optional()?
        } else {
            conn.query_row(
                "SELECT * FROM sessions WHERE token = ?1 AND status = 'active' AND expires_at > ?2",
                params![identifier, now],
                row_to_session,
            )
            .optional()?
        };

        Ok(session)
    }

    pub fn get_server_sessions(&self, server_id: &str) -> CoreResult<Vec<Session>> {
        let conn = self.connect()?;
        Self::sweep_expired(&conn)?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions WHERE server_id = ?1 AND status = 'active' AND expires_at > ?2
             ORDER BY server_number DESC",
        )?;
        let rows = stmt
            .query_map(params![server_id, now], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_all_sessions(&self) -> CoreResult<Vec<Session>> {
        let conn = self.connect()?;
        Self::sweep_expired(&conn)?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT * FROM sessions WHERE status = 'active' AND expires_at > ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![now], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rows the recovery manager should transition to `expired` (spec
    /// §4.9 `detectExpiredSessions`) — distinct from the opportunistic
    /// sweep because the recovery manager needs the full row to attempt
    /// killing the remote tmux session first.
    pub fn detect_expired(&self) -> CoreResult<Vec<Session>> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn
            .prepare("SELECT * FROM sessions WHERE status = 'active' AND expires_at < ?1")?;
        let rows = stmt
            .query_map(params![now], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_expired(&self, id: &str) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE sessions SET status = 'expired' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Force a WAL checkpoint, releasing the log file into the main
    /// database file (spec §4.4 `checkpoint`).
    pub fn checkpoint(&self) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    /// Truncating checkpoint, used on shutdown (spec §4.4 `close`, §5
    /// "Graceful shutdown").
    pub fn close(&self) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let registry = SessionRegistry::open(&path).unwrap();
        (dir, registry)
    }

    #[test]
    fn create_session_allocates_numbering_from_one() {
        let (_dir, registry) = registry();
        let s1 = registry
            .create_session("kr4", "tmux1", "demo", &json!({}))
            .unwrap();
        assert_eq!(s1.server_number, 1);
        assert_eq!(s1.identifier(), "kr4:1");
        assert!(s1.token.len() == 8);

        let s2 = registry
            .create_session("kr4", "tmux2", "demo2", &json!({}))
            .unwrap();
        assert_eq!(s2.server_number, 2);
    }

    #[test]
    fn renotify_same_tmux_updates_not_creates() {
        let (_dir, registry) = registry();
        let s1 = registry
            .create_session("kr4", "tmux1", "demo", &json!({"q": "a"}))
            .unwrap();
        let s2 = registry
            .create_session("kr4", "tmux1", "demo-v2", &json!({"q": "b"}))
            .unwrap();
        assert_eq!(s1.id, s2.id);
        assert_eq!(s1.server_number, s2.server_number);
        assert_eq!(s1.token, s2.token);
        assert_eq!(s2.project, "demo-v2");
        assert_eq!(registry.get_server_sessions("kr4").unwrap().len(), 1);
    }

    #[test]
    fn find_session_by_identifier_and_token() {
        let (_dir, registry) = registry();
        let s = registry
            .create_session("kr4", "tmux1", "demo", &json!({}))
            .unwrap();
        let by_id = registry.find_session("kr4:1").unwrap().unwrap();
        assert_eq!(by_id.id, s.id);
        let by_token = registry.find_session(&s.token).unwrap().unwrap();
        assert_eq!(by_token.id, s.id);
        assert!(registry.find_session("nope:9").unwrap().is_none());
    }

    #[test]
    fn numbering_never_reuses_after_delete() {
        let (_dir, registry) = registry();
        for i in 0..3 {
            registry
                .create_session("kr4", &format!("tmux{i}"), "demo", &json!({}))
                .unwrap();
        }
        // Expire and physically delete the highest-numbered session.
        let sessions = registry.get_server_sessions("kr4").unwrap();
        let last = sessions.first().unwrap();
        assert_eq!(last.server_number, 3);
        registry.mark_expired(&last.id).unwrap();

        let s4 = registry
            .create_session("kr4", "tmux-new", "demo", &json!({}))
            .unwrap();
        assert_eq!(s4.server_number, 4);
    }

    #[test]
    fn detect_expired_finds_only_past_expiry() {
        let (_dir, registry) = registry();
        let conn = registry.connect().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, server_id, server_number, token, project, tmux_session,
                created_at, expires_at, status, metadata)
             VALUES ('x', 'kr4', 1, 'TOKEN001', 'demo', 'tmux1', ?1, ?2, 'active', '{}')",
            params![
                (Utc::now() - ChronoDuration::hours(25)).to_rfc3339(),
                (Utc::now() - ChronoDuration::hours(1)).to_rfc3339()
            ],
        )
        .unwrap();

        let expired = registry.detect_expired().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "x");

        // find_session should not surface it even before the sweep runs elsewhere.
        assert!(registry.find_session("kr4:1").unwrap().is_none());
    }
}
