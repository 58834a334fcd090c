//! SQLite executor
//!
//! Connection runs with `PRAGMA query_only = ON`; rusqlite calls are moved to
//! the blocking pool.

use super::{duplicate_column_warnings, ExecutionOutcome, QueryExecutor};
use crate::error::{EngineError, Result, ServiceFailureKind};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

pub struct SqliteExecutor {
    db: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    /// Open an existing database file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| EngineError::executor(ServiceFailureKind::Network, format!("Failed to open {}: {}", path.display(), e)))?;
        info!("Opened SQLite warehouse {}", path.display());
        Self::from_connection(conn)
    }

    /// Wrap an already-populated connection and switch it to query-only.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, sql: &str, row_limit: u64) -> Result<ExecutionOutcome> {
        let db = Arc::clone(&self.db);
        let sql = sql.trim().trim_end_matches(';').to_string();
        tokio::task::spawn_blocking(move || -> Result<ExecutionOutcome> {
            let conn = db
                .lock()
                .map_err(|_| EngineError::Storage("sqlite executor lock poisoned".to_string()))?;
            Ok(run_query(&conn, &sql, row_limit))
        })
        .await
        .map_err(|e| EngineError::executor(ServiceFailureKind::Network, format!("Executor task failed: {}", e)))?
    }
}

fn run_query(conn: &Connection, sql: &str, row_limit: u64) -> ExecutionOutcome {
    let started = Instant::now();
    let elapsed = || started.elapsed().as_millis() as u64;

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => return ExecutionOutcome::failed(e.to_string(), elapsed()),
    };
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => return ExecutionOutcome::failed(e.to_string(), elapsed()),
    };

    let mut sample = Vec::new();
    while (sample.len() as u64) < row_limit {
        match rows.next() {
            Ok(Some(row)) => {
                let mut obj = serde_json::Map::with_capacity(columns.len());
                for (i, name) in columns.iter().enumerate() {
                    let value = row.get_ref(i).map(to_json).unwrap_or(serde_json::Value::Null);
                    obj.insert(name.clone(), value);
                }
                sample.push(serde_json::Value::Object(obj));
            }
            Ok(None) => break,
            Err(e) => return ExecutionOutcome::failed(e.to_string(), elapsed()),
        }
    }

    let mut outcome = ExecutionOutcome::rows(sample, elapsed());
    outcome.warnings = duplicate_column_warnings(&columns);
    debug!(rows = outcome.row_count, "SQLite dry-run finished");
    outcome
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}
