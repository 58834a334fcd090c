//! SQLite-backed statistics persistence
//!
//! One row per pattern. Writes are guarded so that an older snapshot can
//! never overwrite a newer one (counters only grow).

use super::{PatternStatistics, StatisticsPersistence};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

pub struct SqliteStatisticsPersistence {
    db: Mutex<Connection>,
}

impl SqliteStatisticsPersistence {
    /// Open (or create) `<dir>/pattern_statistics.db`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("pattern_statistics.db");
        let db = Connection::open(&db_path)
            .map_err(|e| EngineError::Storage(format!("Failed to open database {}: {}", db_path.display(), e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        info!("Opened pattern statistics at {}", db_path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_statistics (
                pattern_id TEXT PRIMARY KEY,
                total_matches INTEGER NOT NULL DEFAULT 0,
                successful_executions INTEGER NOT NULL DEFAULT 0,
                failed_executions INTEGER NOT NULL DEFAULT 0,
                cumulative_execution_ms INTEGER NOT NULL DEFAULT 0,
                last_used TEXT
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::Storage(format!("Failed to create table: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| EngineError::Storage("statistics database lock poisoned".to_string()))
    }
}

impl StatisticsPersistence for SqliteStatisticsPersistence {
    fn load_all(&self) -> Result<HashMap<String, PatternStatistics>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT pattern_id, total_matches, successful_executions, failed_executions,
                    cumulative_execution_ms, last_used
             FROM pattern_statistics",
        )?;
        let rows = stmt.query_map([], |row| {
            let last_used: Option<String> = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                PatternStatistics {
                    total_matches: row.get::<_, i64>(1)? as u64,
                    successful_executions: row.get::<_, i64>(2)? as u64,
                    failed_executions: row.get::<_, i64>(3)? as u64,
                    cumulative_execution_ms: row.get::<_, i64>(4)? as u64,
                    last_used: last_used
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|d| d.with_timezone(&Utc)),
                },
            ))
        })?;

        let mut out = HashMap::new();
        for row in rows {
            let (id, stats) = row?;
            out.insert(id, stats);
        }
        Ok(out)
    }

    fn save(&self, pattern_id: &str, stats: &PatternStatistics) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            r#"
            INSERT INTO pattern_statistics
                (pattern_id, total_matches, successful_executions, failed_executions,
                 cumulative_execution_ms, last_used)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(pattern_id) DO UPDATE SET
                total_matches = excluded.total_matches,
                successful_executions = excluded.successful_executions,
                failed_executions = excluded.failed_executions,
                cumulative_execution_ms = excluded.cumulative_execution_ms,
                last_used = excluded.last_used
            WHERE excluded.total_matches >= pattern_statistics.total_matches
            "#,
            params![
                pattern_id,
                stats.total_matches as i64,
                stats.successful_executions as i64,
                stats.failed_executions as i64,
                stats.cumulative_execution_ms as i64,
                stats.last_used.map(|d| d.to_rfc3339()),
            ],
        )
        .map_err(|e| EngineError::Storage(format!("Failed to save statistics for {}: {}", pattern_id, e)))?;
        Ok(())
    }
}
