//! End-to-end resolution scenarios with scripted model and executor doubles.

use async_trait::async_trait;
use sqlsage::error::Result;
use sqlsage::execution::{ExecutionOutcome, QueryExecutor};
use sqlsage::generation::{GenerationContext, GeneratorPath};
use sqlsage::llm::{LanguageModel, LlmRequest};
use sqlsage::metadata::{CachedSchemaProvider, SchemaMetadata};
use sqlsage::patterns::PatternLibrary;
use sqlsage::stats::{InMemoryPersistence, PatternStatistics, StatisticsStore};
use sqlsage::validation::BusinessRules;
use sqlsage::{CandidateSource, EngineConfig, EngineError, GenerationPath, QueryEngineBuilder, SqlCandidate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers every request with the same text, optionally after a delay.
struct CannedModel {
    response: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl CannedModel {
    fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn stalled() -> Arc<Self> {
        Arc::new(Self {
            response: String::new(),
            delay: Some(Duration::from_secs(10)),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for CannedModel {
    async fn complete(&self, _request: &LlmRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.response.clone())
    }
}

/// Pretends every query succeeds with one row and counts calls.
#[derive(Default)]
struct CountingExecutor {
    calls: AtomicUsize,
}

impl CountingExecutor {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for CountingExecutor {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn execute(&self, _sql: &str, _row_limit: u64) -> Result<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionOutcome::rows(vec![serde_json::json!({"n": 42})], 2))
    }
}

/// A generation path that always returns the same SQL.
struct FixedPath {
    path: GenerationPath,
    sql: &'static str,
    confidence: f64,
}

#[async_trait]
impl GeneratorPath for FixedPath {
    fn path(&self) -> GenerationPath {
        self.path
    }

    async fn generate(&self, _question: &str, _ctx: &GenerationContext) -> Result<SqlCandidate> {
        Ok(SqlCandidate::new(CandidateSource::Path(self.path), self.sql, self.confidence, "fixed"))
    }
}

fn schema() -> SchemaMetadata {
    SchemaMetadata::from_json(include_str!("../config/schema.json")).unwrap()
}

fn patterns() -> PatternLibrary {
    PatternLibrary::from_json(include_str!("../config/patterns.json")).unwrap()
}

fn rules() -> BusinessRules {
    BusinessRules::from_json(include_str!("../config/business_rules.json")).unwrap()
}

fn direct_only() -> EngineConfig {
    EngineConfig {
        enabled_paths: vec![GenerationPath::Direct],
        ..EngineConfig::default()
    }
}

fn builder(config: EngineConfig, executor: Arc<CountingExecutor>) -> QueryEngineBuilder {
    sqlsage::QueryEngine::builder(config)
        .schema(CachedSchemaProvider::from_schema(schema()))
        .patterns(patterns())
        .business_rules(rules())
        .executor(executor)
}

#[tokio::test]
async fn test_scenario_a_pattern_answers_without_generation() {
    let mut history = HashMap::new();
    history.insert(
        "active_loan_count".to_string(),
        PatternStatistics {
            total_matches: 50,
            successful_executions: 48,
            failed_executions: 2,
            cumulative_execution_ms: 5_000,
            last_used: None,
        },
    );
    let stats = StatisticsStore::open(Arc::new(InMemoryPersistence::with_entries(history))).unwrap();
    let llm = CannedModel::new("```sql\nSELECT 1\n```");
    let executor = Arc::new(CountingExecutor::default());

    let engine = builder(EngineConfig::default(), executor.clone())
        .statistics(stats)
        .language_model(llm.clone())
        .build()
        .unwrap();
    let session = engine.resolve("How many active loans do we have?").await.unwrap();

    let chosen = session.chosen().unwrap();
    assert!(chosen.sql.starts_with("SELECT COUNT(*)"));
    assert_eq!(chosen.source, CandidateSource::Pattern("active_loan_count".to_string()));
    assert!(session.final_confidence >= 0.7, "confidence {}", session.final_confidence);
    assert_eq!(llm.calls(), 0);
    assert_eq!(executor.calls(), 1);
    assert_eq!(engine.statistics().get("active_loan_count").unwrap().total_matches, 51);
}

#[tokio::test]
async fn test_scenario_b_drop_statement_never_reaches_executor() {
    let llm = CannedModel::new("DROP TABLE customers");
    let executor = Arc::new(CountingExecutor::default());
    let engine = builder(direct_only(), executor.clone())
        .language_model(llm.clone())
        .build()
        .unwrap();

    let err = engine.resolve("DROP TABLE customers").await.unwrap_err();
    match err {
        EngineError::ValidationFailure(failure) => {
            assert_eq!(failure.stage, "syntactic");
            assert!(failure.critical);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.calls(), 0);

    let session = engine.resolve_session("DROP TABLE customers").await.unwrap();
    assert!(!session.is_accepted());
    assert_eq!(session.validation_trace.len(), 1);
    assert_eq!(session.final_confidence, 0.0);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_scenario_c_missing_columns_abort_before_execution() {
    let llm = CannedModel::new("```sql\nSELECT loan_amount, borrower_name FROM loans WHERE status = 'active'\n```");
    let executor = Arc::new(CountingExecutor::default());
    let engine = builder(direct_only(), executor.clone())
        .language_model(llm)
        .build()
        .unwrap();

    let err = engine.resolve("show loan amounts and borrower names").await.unwrap_err();
    match err {
        EngineError::ValidationFailure(failure) => {
            assert_eq!(failure.stage, "schema");
            assert_eq!(failure.errors.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_scenario_d_self_consistency() {
    let config = EngineConfig {
        pattern_matching_enabled: false,
        ..EngineConfig::default()
    };

    let agreeing: Vec<Arc<dyn GeneratorPath>> = vec![
        Arc::new(FixedPath {
            path: GenerationPath::Direct,
            sql: "SELECT COUNT(*) FROM loans WHERE status = 'active'",
            confidence: 0.8,
        }),
        Arc::new(FixedPath {
            path: GenerationPath::Intermediate,
            sql: "SELECT COUNT(loan_id) FROM loans WHERE status = 'active'",
            confidence: 0.7,
        }),
    ];
    let engine = builder(config.clone(), Arc::new(CountingExecutor::default()))
        .generators(agreeing)
        .build()
        .unwrap();
    let session = engine.resolve("active loan tally").await.unwrap();
    let consistency = session.validation_trace.last().unwrap();
    assert_eq!(consistency.stage, "self_consistency");
    assert!(consistency.passed);
    assert_eq!(consistency.confidence_multiplier, 1.0);
    assert!((session.final_confidence - 0.8).abs() < 1e-9);

    let disjoint: Vec<Arc<dyn GeneratorPath>> = vec![
        Arc::new(FixedPath {
            path: GenerationPath::Direct,
            sql: "SELECT COUNT(*) FROM loans WHERE status = 'active'",
            confidence: 0.8,
        }),
        Arc::new(FixedPath {
            path: GenerationPath::LogicalPlan,
            sql: "SELECT COUNT(*) FROM customers WHERE is_active = true",
            confidence: 0.6,
        }),
    ];
    let engine = builder(config, Arc::new(CountingExecutor::default()))
        .generators(disjoint)
        .build()
        .unwrap();
    let session = engine.resolve("active loan tally").await.unwrap();
    let consistency = session.validation_trace.last().unwrap();
    assert!(session.is_accepted());
    assert!(!consistency.passed);
    assert!(consistency.confidence_multiplier < 1.0);
    assert!(session.final_confidence < 0.8);
}

#[tokio::test]
async fn test_scenario_e_timeout_exhausts_generation() {
    let config = EngineConfig {
        llm_timeout_secs: 1,
        ..EngineConfig::default()
    };
    let llm = CannedModel::stalled();
    let executor = Arc::new(CountingExecutor::default());
    let engine = builder(config, executor.clone())
        .language_model(llm)
        .build()
        .unwrap();

    let err = engine.resolve("which branch grew fastest last quarter").await.unwrap_err();
    match err {
        EngineError::GenerationExhausted { attempted_paths, .. } => {
            assert_eq!(attempted_paths, vec!["direct", "intermediate", "logical_plan"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_revalidation_is_idempotent() {
    let engine = builder(EngineConfig::default(), Arc::new(CountingExecutor::default()))
        .build()
        .unwrap();
    let sql = "SELECT product_type, SUM(outstanding_balance) FROM loans GROUP BY product_type";
    let first = engine.validate_sql(sql).await.unwrap();
    let second = engine.validate_sql(sql).await.unwrap();
    assert_eq!(first.results, second.results);
    assert_eq!(first.overall_confidence, second.overall_confidence);
}
