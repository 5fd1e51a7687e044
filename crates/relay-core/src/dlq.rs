use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};

/// Escalating retry intervals in seconds (spec §4.3).
pub const RETRY_INTERVALS_SECS: [i64; 5] = [60, 120, 240, 480, 960];
pub const MAX_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterMessage {
    pub id: String,
    pub message_type: String,
    pub payload: Value,
    pub attempt_count: i64,
    pub first_failed_at: DateTime<Utc>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_error: String,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    pub total: u64,
    pub pending: u64,
    pub archived: u64,
    pub by_type: HashMap<String, u64>,
}

fn row_to_message(row: &Row) -> rusqlite::Result<DeadLetterMessage> {
    let payload_raw: String = row.get("payload")?;
    let first_failed_at: String = row.get("first_failed_at")?;
    let last_attempted_at: Option<String> = row.get("last_attempted_at")?;
    let created_at: String = row.get("created_at")?;
    Ok(DeadLetterMessage {
        id: row.get("id")?,
        message_type: row.get("type")?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
        attempt_count: row.get("attempt_count")?,
        first_failed_at: DateTime::parse_from_rfc3339(&first_failed_at)
            .unwrap()
            .with_timezone(&Utc),
        last_attempted_at: last_attempted_at
            .map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        last_error: row.get("last_error")?,
        archived: row.get::<_, i64>("archived")? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc),
    })
}

/// SQLite-backed dead-letter queue (spec §4.3), same durability discipline
/// as the session registry (WAL, short-lived connections per call).
pub struct DeadLetterQueue {
    db_path: PathBuf,
    max_attempts: i64,
    retry_intervals_secs: Vec<i64>,
}

impl DeadLetterQueue {
    pub fn open(db_path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_policy(db_path, MAX_ATTEMPTS, RETRY_INTERVALS_SECS.to_vec())
    }

    pub fn open_with_policy(
        db_path: impl AsRef<Path>,
        max_attempts: i64,
        retry_intervals_secs: Vec<i64>,
    ) -> CoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::Internal(e.into()))?;
            }
        }
        let queue = Self {
            db_path,
            max_attempts,
            retry_intervals_secs,
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA cache_size=-2000;",
        )?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                first_failed_at TEXT NOT NULL,
                last_attempted_at TEXT,
                last_error TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dlq_type ON dead_letters(type);
            CREATE INDEX IF NOT EXISTS idx_dlq_archived ON dead_letters(archived);
            CREATE INDEX IF NOT EXISTS idx_dlq_last_attempted
                ON dead_letters(last_attempted_at) WHERE archived = 0;",
        )?;
        Ok(())
    }

    fn retry_interval_for(&self, attempt_count: i64) -> i64 {
        let idx = (attempt_count as usize).min(self.retry_intervals_secs.len() - 1);
        self.retry_intervals_secs[idx]
    }

    pub fn enqueue(
        &self,
        message_type: &str,
        payload: &Value,
        error: &str,
    ) -> CoreResult<String> {
        let conn = self.connect()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let payload_str = serde_json::to_string(payload).map_err(|e| CoreError::Internal(e.into()))?;
        conn.execute(
            "INSERT INTO dead_letters
                (id, type, payload, attempt_count, first_failed_at, last_attempted_at,
                 last_error, archived, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, NULL, ?5, 0, ?4)",
            params![id, message_type, payload_str, now, error],
        )?;
        debug!(message_type, %id, "enqueued dead-letter message");
        Ok(id)
    }

    /// Non-archived messages that are ready for another attempt, oldest
    /// `first_failed_at` first (spec §4.3 `dequeuePending`).
    pub fn dequeue_pending(&self, limit: usize) -> CoreResult<Vec<DeadLetterMessage>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM dead_letters
             WHERE archived = 0 AND attempt_count < ?1
             ORDER BY first_failed_at ASC",
        )?;
        let now = Utc::now();
        let candidates = stmt
            .query_map(params![self.max_attempts], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let ready: Vec<DeadLetterMessage> = candidates
            .into_iter()
            .filter(|m| match m.last_attempted_at {
                None => true,
                Some(last) => {
                    let interval = self.retry_interval_for(m.attempt_count);
                    now >= last + ChronoDuration::seconds(interval)
                }
            })
            .take(limit)
            .collect();
        Ok(ready)
    }

    pub fn record_retry_attempt(&self, message_id: &str, error: &str) -> CoreResult<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE dead_letters
             SET attempt_count = attempt_count + 1,
                 last_attempted_at = ?1,
                 last_error = ?2,
                 archived = CASE WHEN attempt_count + 1 >= ?3 THEN 1 ELSE 0 END
             WHERE id = ?4",
            params![now, error, self.max_attempts, message_id],
        )?;
        Ok(())
    }

    pub fn record_success(&self, message_id: &str) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM dead_letters WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    pub fn archive(&self, message_id: &str) -> CoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE dead_letters SET archived = 1 WHERE id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    pub fn cleanup_old_archived(&self, days_old: i64) -> CoreResult<usize> {
        let conn = self.connect()?;
        let cutoff = (Utc::now() - ChronoDuration::days(days_old)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM dead_letters WHERE archived = 1 AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn stats(&self) -> CoreResult<DlqStats> {
        let conn = self.connect()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
        let archived: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE archived = 1",
            [],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare("SELECT type, COUNT(*) FROM dead_letters GROUP BY type")?;
        let by_type: HashMap<String, u64> = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(DlqStats {
            total: total as u64,
            pending: (total - archived) as u64,
            archived: archived as u64,
            by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn queue() -> (tempfile::TempDir, DeadLetterQueue) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlq.db");
        let queue = DeadLetterQueue::open(&path).unwrap();
        (dir, queue)
    }

    #[test]
    fn enqueue_then_dequeue_immediately_ready() {
        let (_dir, queue) = queue();
        let id = queue
            .enqueue("telegram_notification", &json!({"text": "hi"}), "boom")
            .unwrap();
        let pending = queue.dequeue_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].attempt_count, 0);
    }

    #[test]
    fn record_retry_attempt_increments_and_not_immediately_ready() {
        let (_dir, queue) = queue();
        let id = queue
            .enqueue("telegram_notification", &json!({}), "boom")
            .unwrap();
        queue.record_retry_attempt(&id, "boom again").unwrap();
        // Interval for attempt_count=1 is 120s; just-attempted should not be ready.
        let pending = queue.dequeue_pending(10).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn archives_at_max_attempts() {
        let (_dir, queue) =
            {
                let dir = tempdir().unwrap();
                let path = dir.path().join("dlq.db");
                let queue = DeadLetterQueue::open_with_policy(&path, 2, vec![0, 0]).unwrap();
                (dir, queue)
            };
        let id = queue.enqueue("t", &json!({}), "e").unwrap();
        queue.record_retry_attempt(&id, "e").unwrap();
        queue.record_retry_attempt(&id, "e").unwrap();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.archived, 1);
        assert!(queue.dequeue_pending(10).unwrap().is_empty());
    }

    #[test]
    fn record_success_deletes_row() {
        let (_dir, queue) = queue();
        let id = queue.enqueue("t", &json!({}), "e").unwrap();
        queue.record_success(&id).unwrap();
        assert_eq!(queue.stats().unwrap().total, 0);
    }

    #[test]
    fn stats_group_by_type() {
        let (_dir, queue) = queue();
        queue.enqueue("telegram_notification", &json!({}), "e").unwrap();
        queue.enqueue("telegram_notification", &json!({}), "e").unwrap();
        queue.enqueue("other", &json!({}), "e").unwrap();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type["telegram_notification"], 2);
        assert_eq!(stats.by_type["other"], 1);
    }
}
