use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::run::SessionRecord;
use flowline_core::traits::SessionStore;
use flowline_core::types::SessionId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_sessions (
        session_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_name TEXT NOT NULL,
        user_id TEXT,
        session_name TEXT,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflow_sessions_updated
        ON workflow_sessions(updated_at);";

/// SQLite-backed session store. Each session is one row holding the
/// JSON-encoded record, with identity columns alongside for inspection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowlineError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| FlowlineError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowlineError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowlineError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| FlowlineError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowlineError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowlineError::Database(e.to_string()))
    }
}

fn decode(json: &str) -> Result<SessionRecord> {
    serde_json::from_str(json)
        .map_err(|e| FlowlineError::Database(format!("Corrupt session record: {}", e)))
}

impl SessionStore for SqliteStore {
    fn get_session(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<SessionRecord>>> {
        let sid = session_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let row: Option<String> = conn
                .query_row(
                    "SELECT record FROM workflow_sessions WHERE session_id = ?1",
                    params![sid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FlowlineError::Database(e.to_string()))?;

            row.as_deref().map(decode).transpose()
        })
    }

    fn upsert_session(&self, record: SessionRecord) -> BoxFuture<'_, Result<SessionRecord>> {
        Box::pin(async move {
            let json = serde_json::to_string(&record)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflow_sessions
                    (session_id, workflow_id, workflow_name, user_id, session_name, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(session_id) DO UPDATE SET
                    workflow_id = excluded.workflow_id,
                    workflow_name = excluded.workflow_name,
                    user_id = excluded.user_id,
                    session_name = excluded.session_name,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![
                    record.session_id.0,
                    record.workflow_id,
                    record.workflow_name,
                    record.user_id,
                    record.session_name,
                    json,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| FlowlineError::Database(e.to_string()))?;

            debug!(session_id = %record.session_id, runs = record.runs.len(), "Session saved");
            Ok(record)
        })
    }

    fn delete_session(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let sid = session_id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let removed = conn
                .execute(
                    "DELETE FROM workflow_sessions WHERE session_id = ?1",
                    params![sid],
                )
                .map_err(|e| FlowlineError::Database(e.to_string()))?;
            Ok(removed > 0)
        })
    }

    fn list_sessions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<SessionRecord>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT record FROM workflow_sessions
                     ORDER BY updated_at DESC
                     LIMIT ?1",
                )
                .map_err(|e| FlowlineError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))
                .map_err(|e| FlowlineError::Database(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                let json = row.map_err(|e| FlowlineError::Database(e.to_string()))?;
                records.push(decode(&json)?);
            }
            Ok(records)
        })
    }
}
