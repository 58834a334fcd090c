//! Read-only execution collaborator
//!
//! Executors run row-limited statements for the dry-run stage. They never see
//! a statement that has not passed syntactic validation, and each backend
//! additionally enforces read-only mode at the connection or transaction level.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresExecutor;
pub use sqlite::SqliteExecutor;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of running a statement.
///
/// A statement the database refused (bad column, type error) is an
/// unsuccessful outcome carrying the database's message. An unreachable
/// database is an `Err` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub row_count: u64,
    pub sample_rows: Vec<serde_json::Value>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub fn rows(sample_rows: Vec<serde_json::Value>, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            row_count: sample_rows.len() as u64,
            sample_rows,
            warnings: Vec::new(),
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            row_count: 0,
            sample_rows: Vec::new(),
            warnings: Vec::new(),
            error: Some(error.into()),
            elapsed_ms,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Backend name for logs ("sqlite", "postgres")
    fn name(&self) -> &'static str;

    /// Run `sql`, reading at most `row_limit` rows.
    async fn execute(&self, sql: &str, row_limit: u64) -> Result<ExecutionOutcome>;
}

/// Flag result columns that share a name; the later one shadows the earlier in JSON rows.
pub(crate) fn duplicate_column_warnings(columns: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut warnings = Vec::new();
    for col in columns {
        if !seen.insert(col.to_lowercase()) {
            warnings.push(format!("Result has duplicate column name '{}'", col));
        }
    }
    warnings
}
