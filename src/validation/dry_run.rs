//! Stage 4: Dry Run
//!
//! Executes the query against the configured backend with a capped row limit
//! and a timeout. Any execution error rejects the query; a successful run is
//! discounted for executor warnings and empty results.

use super::analysis::parse_query;
use super::{Stage, ValidationContext, ValidationResult, Validator};
use crate::execution::QueryExecutor;
use crate::session::SqlCandidate;
use async_trait::async_trait;
use sqlparser::ast::{Expr, Statement, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WARNING_PENALTY: f64 = 0.05;
const EMPTY_RESULT_PENALTY: f64 = 0.1;
const MULTIPLIER_FLOOR: f64 = 0.7;

pub struct DryRunValidator {
    executor: Option<Arc<dyn QueryExecutor>>,
    row_limit: u64,
    timeout: Duration,
}

impl DryRunValidator {
    pub fn new(executor: Option<Arc<dyn QueryExecutor>>, row_limit: u64, timeout: Duration) -> Self {
        Self {
            executor,
            row_limit: row_limit.max(1),
            timeout,
        }
    }
}

#[async_trait]
impl Validator for DryRunValidator {
    fn stage(&self) -> Stage {
        Stage::DryRun
    }

    async fn validate(&self, sql: &str, _candidates: &[SqlCandidate], ctx: &ValidationContext) -> ValidationResult {
        let Some(ref executor) = self.executor else {
            return ValidationResult::pass(Stage::DryRun)
                .with_warnings(vec!["No execution backend configured; dry-run skipped".to_string()]);
        };

        let capped = cap_limit(sql, self.row_limit);
        debug!(backend = executor.name(), sql = %capped, "Dry-running query");

        let outcome = match tokio::time::timeout(self.timeout, executor.execute(&capped, self.row_limit)).await {
            Err(_) => {
                warn!(backend = executor.name(), "Dry-run timed out");
                return ValidationResult::fail(
                    Stage::DryRun,
                    vec![format!("Dry-run timed out after {}s", self.timeout.as_secs_f64())],
                )
                .with_suggestions(vec!["Add filters so the query touches fewer rows".to_string()]);
            }
            Ok(Err(e)) => {
                warn!(backend = executor.name(), error = %e, "Dry-run backend unavailable");
                return ValidationResult::fail(Stage::DryRun, vec![e.to_string()]);
            }
            Ok(Ok(outcome)) => outcome,
        };

        if !outcome.success {
            let error = outcome.error.clone().unwrap_or_else(|| "Execution failed".to_string());
            ctx.record_execution(outcome);
            return ValidationResult::fail(Stage::DryRun, vec![error]);
        }

        let mut multiplier = 1.0 - WARNING_PENALTY * outcome.warnings.len() as f64;
        let mut warnings = outcome.warnings.clone();
        if outcome.row_count == 0 {
            multiplier -= EMPTY_RESULT_PENALTY;
            warnings.push("Query returned no rows".to_string());
        }
        ctx.record_execution(outcome);
        ValidationResult::pass(Stage::DryRun)
            .with_multiplier(multiplier.max(MULTIPLIER_FLOOR))
            .with_warnings(warnings)
    }
}

/// Rewrite the statement's LIMIT so it never exceeds `cap`. SQL that does not
/// parse as a single query is returned unchanged.
pub fn cap_limit(sql: &str, cap: u64) -> String {
    let Some(Statement::Query(mut query)) = parse_query(sql) else {
        return sql.to_string();
    };
    let within_cap = match query.limit {
        Some(Expr::Value(Value::Number(ref n, _))) => n.parse::<u64>().map(|n| n <= cap).unwrap_or(false),
        _ => false,
    };
    if !within_cap {
        query.limit = Some(Expr::Value(Value::Number(cap.to_string(), false)));
    }
    query.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::execution::sqlite::tests::seeded_executor;
    use crate::execution::ExecutionOutcome;
    use crate::validation::tests::ctx;

    fn validator() -> DryRunValidator {
        DryRunValidator::new(Some(Arc::new(seeded_executor())), 10, Duration::from_secs(5))
    }

    struct Stalled;

    #[async_trait]
    impl QueryExecutor for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn execute(&self, _sql: &str, _row_limit: u64) -> Result<ExecutionOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(EngineError::Storage("unreachable".to_string()))
        }
    }

    #[test]
    fn test_cap_limit() {
        assert_eq!(cap_limit("SELECT loan_id FROM loans", 10), "SELECT loan_id FROM loans LIMIT 10");
        assert_eq!(cap_limit("SELECT loan_id FROM loans LIMIT 5", 10), "SELECT loan_id FROM loans LIMIT 5");
        assert_eq!(cap_limit("SELECT loan_id FROM loans LIMIT 500", 10), "SELECT loan_id FROM loans LIMIT 10");
        assert_eq!(cap_limit("not a query", 10), "not a query");
    }

    #[tokio::test]
    async fn test_successful_run_records_outcome() {
        let ctx = ctx();
        let result = validator()
            .validate("SELECT status, COUNT(*) AS n FROM loans GROUP BY status", &[], &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.confidence_multiplier, 1.0);
        let outcome = ctx.take_execution().unwrap();
        assert_eq!(outcome.row_count, 2);
    }

    #[tokio::test]
    async fn test_execution_error_is_critical_failure() {
        let result = validator()
            .validate("SELECT missing_column FROM loans", &[], &ctx())
            .await;
        assert!(!result.passed);
        assert_eq!(result.confidence_multiplier, 0.0);
        assert!(result.errors[0].contains("missing_column"));
    }

    #[tokio::test]
    async fn test_empty_result_is_discounted() {
        let result = validator()
            .validate("SELECT loan_id FROM loans WHERE status = 'closed'", &[], &ctx())
            .await;
        assert!(result.passed);
        assert!((result.confidence_multiplier - 0.9).abs() < 1e-9);
        assert!(result.warnings.iter().any(|w| w.contains("no rows")));
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let validator = DryRunValidator::new(Some(Arc::new(Stalled)), 10, Duration::from_millis(20));
        let result = validator.validate("SELECT 1", &[], &ctx()).await;
        assert!(!result.passed);
        assert!(result.errors[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_without_backend_passes_with_warning() {
        let validator = DryRunValidator::new(None, 10, Duration::from_secs(1));
        let result = validator.validate("SELECT 1", &[], &ctx()).await;
        assert!(result.passed);
        assert_eq!(result.confidence_multiplier, 1.0);
        assert_eq!(result.warnings.len(), 1);
    }
}
