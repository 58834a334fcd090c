//! Postgres executor
//!
//! Every statement runs inside a `READ ONLY` transaction that is always rolled
//! back. Rows come back as `row_to_json` text so any result shape can be
//! sampled without per-type decoding.

use super::{ExecutionOutcome, QueryExecutor};
use crate::error::{EngineError, Result, ServiceFailureKind};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| EngineError::executor(ServiceFailureKind::Network, format!("Failed to connect to Postgres: {}", e)))?;
        info!("Connected to Postgres warehouse");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// `SELECT row_to_json(t)::text FROM (<sql>) t LIMIT n`
fn wrap_for_sampling(sql: &str, row_limit: u64) -> String {
    let inner = sql.trim().trim_end_matches(';');
    format!("SELECT row_to_json(t)::text FROM ({}) t LIMIT {}", inner, row_limit)
}

fn classify(err: sqlx::Error) -> std::result::Result<String, EngineError> {
    match err {
        sqlx::Error::Database(db) => Ok(db.message().to_string()),
        sqlx::Error::PoolTimedOut => Err(EngineError::executor(ServiceFailureKind::Timeout, "Postgres pool timed out")),
        sqlx::Error::Io(e) => Err(EngineError::executor(ServiceFailureKind::Network, e.to_string())),
        sqlx::Error::Tls(e) => Err(EngineError::executor(ServiceFailureKind::Network, e.to_string())),
        sqlx::Error::PoolClosed => Err(EngineError::executor(ServiceFailureKind::Network, "Postgres pool closed")),
        other => Ok(other.to_string()),
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn execute(&self, sql: &str, row_limit: u64) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(|e| match classify(e) {
            Ok(message) => EngineError::executor(ServiceFailureKind::Network, message),
            Err(err) => err,
        })?;

        let sampling_sql = wrap_for_sampling(sql, row_limit);
        let result = async {
            sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
            sqlx::query_scalar::<_, String>(&sampling_sql).fetch_all(&mut *tx).await
        }
        .await;

        if let Err(e) = tx.rollback().await {
            warn!("Rollback after dry-run failed: {}", e);
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(rows) => {
                let mut sample = Vec::with_capacity(rows.len());
                for raw in rows {
                    sample.push(serde_json::from_str(&raw)?);
                }
                debug!(rows = sample.len(), "Postgres dry-run finished");
                Ok(ExecutionOutcome::rows(sample, elapsed_ms))
            }
            Err(e) => Ok(ExecutionOutcome::failed(classify(e)?, elapsed_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_for_sampling_strips_terminator() {
        let wrapped = wrap_for_sampling("SELECT loan_id FROM loans;", 10);
        assert_eq!(wrapped, "SELECT row_to_json(t)::text FROM (SELECT loan_id FROM loans) t LIMIT 10");
    }

    #[test]
    fn test_connection_errors_are_service_failures() {
        let err = classify(sqlx::Error::PoolTimedOut).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ExternalService { kind: ServiceFailureKind::Timeout, .. }
        ));
        assert!(!classify(sqlx::Error::RowNotFound).unwrap().is_empty());
    }
}
