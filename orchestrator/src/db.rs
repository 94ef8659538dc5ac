//! SQLite execution store
//!
//! Stores each execution as a JSON blob next to the columns used for
//! filtering. Default location: ~/.orchestrator/executions.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{OrchestratorError, Result};
use crate::store::ExecutionStore;
use crate::workflow::{ExecutionFilter, WorkflowExecutionState};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

fn storage_err(err: rusqlite::Error) -> OrchestratorError {
    OrchestratorError::Storage(err.to_string())
}

/// SQLite-backed [`ExecutionStore`] with thread-safe access
#[derive(Clone)]
pub struct SqliteExecutionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutionStore {
    /// Open or create the database at a specific path
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrchestratorError::Storage(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let conn = Connection::open(&path).map_err(storage_err)?;
        let store = Self::from_connection(conn)?;
        tracing::info!("Execution store opened at {:?}", path);
        Ok(store)
    }

    /// In-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Create all tables if they don't exist
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            state_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_executions_user
        ON executions(user_id, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_executions_status
        ON executions(status);

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )
    .map_err(storage_err)
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn save(&self, state: &WorkflowExecutionState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO executions (id, workflow_id, user_id, status, state_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
            params![
                state.id,
                state.workflow_id,
                state.user_id,
                state.status.as_str(),
                json,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecutionState>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM executions WHERE id = ?1",
                [execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecutionState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT state_json FROM executions
                WHERE (?1 IS NULL OR user_id = ?1)
                  AND (?2 IS NULL OR workflow_id = ?2)
                  AND (?3 IS NULL OR status = ?3)
                ORDER BY created_at DESC
                LIMIT ?4
                "#,
            )
            .map_err(storage_err)?;

        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(
                params![
                    filter.user_id,
                    filter.workflow_id,
                    filter.status.map(|s| s.as_str()),
                    limit
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(storage_err)?;

        let mut states = Vec::new();
        for row in rows {
            let json = row.map_err(storage_err)?;
            states.push(serde_json::from_str(&json)?);
        }
        Ok(states)
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute("DELETE FROM executions WHERE id = ?1", [execution_id])
            .map_err(storage_err)?;
        Ok(removed > 0)
    }
}
