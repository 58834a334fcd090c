//! Feedback rewards
//!
//! Every closed session can be scored with the four feedback signals and the
//! weighted reward, and stored per session for later per-pattern aggregation.

use crate::confidence::{ConfidenceCalculator, FeedbackSignals};
use crate::error::{EngineError, Result};
use crate::session::QuerySession;
use crate::validation::analysis::parse_query;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Execution signal when the dry-run was skipped for lack of a backend.
const UNKNOWN_EXECUTION: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub session_id: String,
    pub pattern_id: Option<String>,
    pub signals: FeedbackSignals,
    pub reward: f64,
}

impl FeedbackRecord {
    /// Score a closed session. `user_verdict` overrides the validator's judgment of the result.
    pub fn score(session: &QuerySession, user_verdict: Option<bool>, calculator: &ConfidenceCalculator) -> Self {
        let sql = session.chosen().map(|c| c.sql.as_str()).unwrap_or_default();
        let signals = FeedbackSignals {
            format: if parse_query(sql).is_some() { 1.0 } else { 0.0 },
            execution: match session.execution {
                Some(ref outcome) if outcome.success => 1.0,
                Some(_) => 0.0,
                None if session.is_accepted() => UNKNOWN_EXECUTION,
                None => 0.0,
            },
            result: match user_verdict {
                Some(true) => 1.0,
                Some(false) => 0.0,
                None if session.is_accepted() => session.final_confidence,
                None => 0.0,
            },
            length: ConfidenceCalculator::length_signal(sql),
        };
        Self {
            session_id: session.id.to_string(),
            pattern_id: session
                .chosen()
                .and_then(|c| c.source.pattern_id())
                .map(|id| id.to_string()),
            reward: calculator.reward(&signals),
            signals,
        }
    }
}

pub struct FeedbackStore {
    db: Mutex<Connection>,
}

impl FeedbackStore {
    /// Open (or create) `<dir>/feedback.db`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("feedback.db");
        let db = Connection::open(&db_path)
            .map_err(|e| EngineError::Storage(format!("Failed to open database {}: {}", db_path.display(), e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        info!("Opened feedback store at {}", db_path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS feedback (
                session_id TEXT PRIMARY KEY,
                pattern_id TEXT,
                question TEXT NOT NULL,
                sql TEXT NOT NULL,
                format_signal REAL NOT NULL,
                execution_signal REAL NOT NULL,
                result_signal REAL NOT NULL,
                length_signal REAL NOT NULL,
                reward REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_feedback_pattern ON feedback(pattern_id);
            "#,
        )
        .map_err(|e| EngineError::Storage(format!("Failed to create feedback table: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| EngineError::Storage("feedback database lock poisoned".to_string()))
    }

    /// Score and store a session. Recording the same session again replaces its row.
    pub fn record(
        &self,
        session: &QuerySession,
        user_verdict: Option<bool>,
        calculator: &ConfidenceCalculator,
    ) -> Result<FeedbackRecord> {
        let record = FeedbackRecord::score(session, user_verdict, calculator);
        let sql = session.chosen().map(|c| c.sql.as_str()).unwrap_or_default();
        let db = self.lock()?;
        db.execute(
            r#"
            INSERT OR REPLACE INTO feedback
                (session_id, pattern_id, question, sql, format_signal, execution_signal,
                 result_signal, length_signal, reward, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.session_id,
                record.pattern_id,
                session.question,
                sql,
                record.signals.format,
                record.signals.execution,
                record.signals.result,
                record.signals.length,
                record.reward,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(session = %record.session_id, reward = record.reward, "Recorded feedback");
        Ok(record)
    }

    /// Mean reward over sessions resolved by `pattern_id`.
    pub fn average_reward(&self, pattern_id: &str) -> Result<Option<f64>> {
        let db = self.lock()?;
        let avg = db
            .query_row(
                "SELECT AVG(reward) FROM feedback WHERE pattern_id = ?1",
                params![pattern_id],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?
            .flatten();
        Ok(avg)
    }

    pub fn count(&self) -> Result<u64> {
        let db = self.lock()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
