//! Validation Pipeline
//!
//! Five stages in a fixed order. Critical stages (syntactic, schema, dry-run)
//! halt the pipeline on failure; non-critical ones (business rules,
//! self-consistency) only lower confidence. Overall confidence is the product
//! of the multipliers of every stage that ran.

pub mod analysis;
pub mod business_rules;
pub mod consistency;
pub mod dry_run;
pub mod schema;
pub mod syntactic;

pub use business_rules::{BusinessRule, BusinessRuleValidator, BusinessRules};
pub use consistency::SelfConsistencyValidator;
pub use dry_run::DryRunValidator;
pub use schema::SchemaValidator;
pub use syntactic::SyntacticValidator;

use crate::confidence::ConfidenceCalculator;
use crate::error::{EngineError, Result, ValidationFailure};
use crate::execution::{ExecutionOutcome, QueryExecutor};
use crate::metadata::SchemaMetadata;
use crate::session::{clamp_unit, SqlCandidate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Syntactic,
    Schema,
    BusinessRules,
    DryRun,
    SelfConsistency,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Syntactic,
        Stage::Schema,
        Stage::BusinessRules,
        Stage::DryRun,
        Stage::SelfConsistency,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Syntactic => "syntactic",
            Stage::Schema => "schema",
            Stage::BusinessRules => "business_rules",
            Stage::DryRun => "dry_run",
            Stage::SelfConsistency => "self_consistency",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Stage::Syntactic | Stage::Schema | Stage::DryRun)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub stage: String,
    pub passed: bool,
    /// Always within [0, 1]
    pub confidence_multiplier: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn pass(stage: Stage) -> Self {
        Self {
            stage: stage.name().to_string(),
            passed: true,
            confidence_multiplier: 1.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn fail(stage: Stage, errors: Vec<String>) -> Self {
        Self {
            stage: stage.name().to_string(),
            passed: false,
            confidence_multiplier: 0.0,
            errors,
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.confidence_multiplier = clamp_unit(multiplier);
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        for s in suggestions {
            if !self.suggestions.contains(&s) {
                self.suggestions.push(s);
            }
        }
        self
    }
}

/// Per-run state shared by the stages of one pipeline run.
pub struct ValidationContext {
    pub schema: Arc<SchemaMetadata>,
    dry_run: Mutex<Option<ExecutionOutcome>>,
}

impl ValidationContext {
    pub fn new(schema: Arc<SchemaMetadata>) -> Self {
        Self {
            schema,
            dry_run: Mutex::new(None),
        }
    }

    pub fn record_execution(&self, outcome: ExecutionOutcome) {
        if let Ok(mut slot) = self.dry_run.lock() {
            *slot = Some(outcome);
        }
    }

    pub fn take_execution(&self) -> Option<ExecutionOutcome> {
        self.dry_run.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn stage(&self) -> Stage;

    fn name(&self) -> &'static str {
        self.stage().name()
    }

    fn is_critical(&self) -> bool {
        self.stage().is_critical()
    }

    /// `candidates` holds every candidate produced for the question, the chosen one included.
    async fn validate(&self, sql: &str, candidates: &[SqlCandidate], ctx: &ValidationContext) -> ValidationResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVerdict {
    pub results: Vec<ValidationResult>,
    pub overall_confidence: f64,
    /// Critical stage that halted the pipeline
    pub failed_stage: Option<String>,
    pub dry_run: Option<ExecutionOutcome>,
}

impl PipelineVerdict {
    pub fn accepted(&self) -> bool {
        self.failed_stage.is_none()
    }

    /// Warnings from every stage, in stage order.
    pub fn warnings(&self) -> Vec<String> {
        self.results.iter().flat_map(|r| r.warnings.iter().cloned()).collect()
    }

    /// The rejecting stage as an error, if the pipeline halted.
    pub fn failure(&self, sql: &str) -> Option<ValidationFailure> {
        let stage = self.failed_stage.as_ref()?;
        let result = self.results.iter().find(|r| &r.stage == stage)?;
        Some(ValidationFailure {
            stage: stage.clone(),
            critical: true,
            sql: sql.to_string(),
            errors: result.errors.clone(),
            warnings: self.warnings(),
            suggestions: result.suggestions.clone(),
        })
    }

    pub fn into_error(self, sql: &str) -> Option<EngineError> {
        self.failure(sql).map(|f| EngineError::ValidationFailure(Box::new(f)))
    }
}

/// Settings the standard stages need.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dry_run_row_limit: u64,
    pub dry_run_timeout: Duration,
    pub self_consistency_threshold: f64,
    pub business_rule_penalty: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dry_run_row_limit: 10,
            dry_run_timeout: Duration::from_secs(15),
            self_consistency_threshold: 0.5,
            business_rule_penalty: 0.1,
        }
    }
}

pub struct ValidationPipeline {
    stages: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    /// The five standard stages. Without an executor the dry-run stage passes with a warning.
    pub fn standard(
        settings: &PipelineSettings,
        rules: Arc<BusinessRules>,
        executor: Option<Arc<dyn QueryExecutor>>,
    ) -> Self {
        Self {
            stages: vec![
                Box::new(SyntacticValidator),
                Box::new(SchemaValidator),
                Box::new(BusinessRuleValidator::new(rules, settings.business_rule_penalty)),
                Box::new(DryRunValidator::new(executor, settings.dry_run_row_limit, settings.dry_run_timeout)),
                Box::new(SelfConsistencyValidator::new(settings.self_consistency_threshold)),
            ],
        }
    }

    /// Custom registry. Stages must be distinct and follow `Stage::ORDER`.
    pub fn with_stages(stages: Vec<Box<dyn Validator>>) -> Result<Self> {
        for pair in stages.windows(2) {
            if pair[0].stage() >= pair[1].stage() {
                return Err(EngineError::Configuration(format!(
                    "Validation stage '{}' cannot run after '{}'",
                    pair[1].name(),
                    pair[0].name()
                )));
            }
        }
        Ok(Self { stages })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, halting at the first critical failure.
    pub async fn run(&self, sql: &str, candidates: &[SqlCandidate], schema: Arc<SchemaMetadata>) -> PipelineVerdict {
        let ctx = ValidationContext::new(schema);
        let mut results = Vec::with_capacity(self.stages.len());
        let mut failed_stage = None;

        for stage in &self.stages {
            let result = stage.validate(sql, candidates, &ctx).await;
            debug!(
                stage = stage.name(),
                passed = result.passed,
                multiplier = result.confidence_multiplier,
                "Validation stage finished"
            );
            let halt = !result.passed && stage.is_critical();
            if !result.passed && !halt {
                warn!(stage = stage.name(), warnings = ?result.warnings, "Non-critical validation stage failed");
            }
            results.push(result);
            if halt {
                failed_stage = Some(stage.name().to_string());
                break;
            }
        }

        let overall_confidence = ConfidenceCalculator::pipeline_confidence(results.iter().map(|r| r.confidence_multiplier));
        match failed_stage {
            Some(ref stage) => info!(stage = %stage, "Validation rejected query"),
            None => info!(confidence = overall_confidence, "Validation passed"),
        }

        PipelineVerdict {
            results,
            overall_confidence,
            failed_stage,
            dry_run: ctx.take_execution(),
        }
    }
}
