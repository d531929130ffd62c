//! SQLite checkpoint store
//!
//! Persists checkpoints in the `invoice_checkpoints` table. Connections come
//! from an r2d2 pool so distinct checkpoint ids can be saved and loaded from
//! several threads at once.

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use crate::engine::checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary};
use crate::engine::state::StateRecord;
use crate::error::{FlowError, FlowResult};

type Pool = r2d2::Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS invoice_checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    status TEXT NOT NULL,
    step TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_invoice_checkpoints_status
    ON invoice_checkpoints(status, created_at);
";

/// SQLite-backed checkpoint store
pub struct SqliteCheckpointStore {
    pool: Pool,
}

impl SqliteCheckpointStore {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = r2d2::Pool::builder().build(manager)?;
        Self::with_pool(pool)
    }

    /// Private in-memory database
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// limited to a single connection.
    pub fn in_memory() -> FlowResult<Self> {
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::with_pool(pool)
    }

    /// Use an existing pool; creates the table and index if missing
    pub fn with_pool(pool: Pool) -> FlowResult<Self> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(column: &str, value: &str) -> FlowResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FlowError::Storage(format!("invalid {} timestamp {:?}: {}", column, value, e)))
}

/// Raw row data before parsing JSON and timestamps
struct RawCheckpointRow {
    checkpoint_id: String,
    state_json: String,
    status: String,
    step: String,
    created_at: String,
    updated_at: String,
}

impl RawCheckpointRow {
    fn into_checkpoint(self) -> FlowResult<Checkpoint> {
        let state: StateRecord = serde_json::from_str(&self.state_json)?;
        Ok(Checkpoint {
            checkpoint_id: self.checkpoint_id,
            step: self.step,
            state,
            status: self.status,
            created_at: parse_time("created_at", &self.created_at)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<()> {
        let state_json = serde_json::to_string(&checkpoint.state)?;
        let conn = self.pool.get()?;

        conn.execute(
            "INSERT INTO invoice_checkpoints
             (checkpoint_id, state_json, status, step, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(checkpoint_id) DO UPDATE SET
                state_json = excluded.state_json,
                status = excluded.status,
                step = excluded.step,
                updated_at = excluded.updated_at",
            params![
                checkpoint.checkpoint_id,
                state_json,
                checkpoint.status,
                checkpoint.step,
                format_time(&checkpoint.created_at),
                format_time(&checkpoint.updated_at),
            ],
        )?;

        Ok(())
    }

    fn load(&self, checkpoint_id: &str) -> FlowResult<Checkpoint> {
        let conn = self.pool.get()?;

        let raw = conn
            .query_row(
                "SELECT checkpoint_id, state_json, status, step, created_at, updated_at
                 FROM invoice_checkpoints
                 WHERE checkpoint_id = ?1",
                params![checkpoint_id],
                |row| {
                    Ok(RawCheckpointRow {
                        checkpoint_id: row.get(0)?,
                        state_json: row.get(1)?,
                        status: row.get(2)?,
                        step: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        raw.ok_or_else(|| FlowError::NotFound(checkpoint_id.to_string()))?
            .into_checkpoint()
    }

    fn set_status(&self, checkpoint_id: &str, status: &str) -> FlowResult<()> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE invoice_checkpoints SET status = ?2, updated_at = ?3 WHERE checkpoint_id = ?1",
            params![checkpoint_id, status, format_time(&Utc::now())],
        )?;

        if updated == 0 {
            return Err(FlowError::NotFound(checkpoint_id.to_string()));
        }
        Ok(())
    }

    fn claim(&self, checkpoint_id: &str, status: &str) -> FlowResult<bool> {
        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE invoice_checkpoints SET status = ?2, updated_at = ?3
             WHERE checkpoint_id = ?1 AND status != ?2",
            params![checkpoint_id, status, format_time(&Utc::now())],
        )?;
        if updated > 0 {
            return Ok(true);
        }

        let exists = conn
            .query_row(
                "SELECT 1 FROM invoice_checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id],
                |_| Ok(()),
            )
            .optional()?;
        match exists {
            Some(()) => Ok(false),
            None => Err(FlowError::NotFound(checkpoint_id.to_string())),
        }
    }

    fn list(&self, status: Option<&str>) -> FlowResult<Vec<CheckpointSummary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT checkpoint_id, step, status, created_at, updated_at
             FROM invoice_checkpoints
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at, checkpoint_id",
        )?;

        let rows = stmt.query_map(params![status], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (checkpoint_id, step, status, created_at, updated_at) = row?;
            summaries.push(CheckpointSummary {
                checkpoint_id,
                step,
                status,
                created_at: parse_time("created_at", &created_at)?,
                updated_at: parse_time("updated_at", &updated_at)?,
            });
        }

        Ok(summaries)
    }

    fn delete(&self, checkpoint_id: &str) -> FlowResult<bool> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM invoice_checkpoints WHERE checkpoint_id = ?1",
            params![checkpoint_id],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint(id: &str, status: &str) -> Checkpoint {
        let mut state = StateRecord::from_payload(json!({"invoice_id": id}));
        state.suspend(id, status);
        Checkpoint::new(id, "CHECKPOINT_HITL", state)
    }

    #[test]
    fn test_creates_table() {
        let store = SqliteCheckpointStore::in_memory().unwrap();

        let conn = store.pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='invoice_checkpoints'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_schema_creation_is_idempotent() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        let pool = store.pool.clone();
        assert!(SqliteCheckpointStore::with_pool(pool).is_ok());
    }

    #[test]
    fn test_timestamps_keep_nanoseconds() {
        let now = Utc::now();
        let parsed = parse_time("created_at", &format_time(&now)).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_corrupt_state_is_storage_error() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        store.save(&checkpoint("chk_1", "PAUSED")).unwrap();

        store
            .pool
            .get()
            .unwrap()
            .execute(
                "UPDATE invoice_checkpoints SET state_json = 'not json' WHERE checkpoint_id = 'chk_1'",
                [],
            )
            .unwrap();

        assert!(matches!(store.load("chk_1"), Err(FlowError::Storage(_))));
    }

    #[test]
    fn test_set_status_missing() {
        let store = SqliteCheckpointStore::in_memory().unwrap();
        assert!(matches!(
            store.set_status("nope", "CLAIMED"),
            Err(FlowError::NotFound(_))
        ));
    }
}
