//! Query Engine
//!
//! question -> pattern match (short-circuit) or concurrent generation ->
//! ensemble selection -> validation pipeline -> statistics update.

use crate::confidence::ConfidenceCalculator;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, ValidationFailure};
use crate::execution::QueryExecutor;
use crate::feedback::{FeedbackRecord, FeedbackStore};
use crate::generation::{EnsembleSelector, GenerationContext, GenerationPathSet, GeneratorPath};
use crate::llm::LanguageModel;
use crate::metadata::{CachedSchemaProvider, SchemaMetadata};
use crate::patterns::{PatternLibrary, PatternMatcher, PatternScore};
use crate::session::{QuerySession, SqlCandidate};
use crate::stats::StatisticsStore;
use crate::validation::{BusinessRules, PipelineSettings, PipelineVerdict, ValidationPipeline};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct QueryEngine {
    config: EngineConfig,
    schema: Arc<CachedSchemaProvider>,
    matcher: PatternMatcher,
    stats: Arc<StatisticsStore>,
    generators: GenerationPathSet,
    pipeline: ValidationPipeline,
    feedback: Option<Arc<FeedbackStore>>,
    calculator: ConfidenceCalculator,
}

impl QueryEngine {
    pub fn builder(config: EngineConfig) -> QueryEngineBuilder {
        QueryEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn statistics(&self) -> &StatisticsStore {
        &self.stats
    }

    pub fn patterns(&self) -> &PatternLibrary {
        self.matcher.library()
    }

    pub fn validation_stages(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }

    /// Pattern scores for a question without resolving it.
    pub fn score_patterns(&self, question: &str) -> Vec<PatternScore> {
        self.matcher.score_all(question, &self.stats)
    }

    /// Reload schema metadata; resolutions already running keep their snapshot.
    pub async fn refresh_schema(&self) -> Result<Arc<SchemaMetadata>> {
        self.schema.refresh().await
    }

    /// Resolve a question and return the closed session, accepted or rejected.
    /// Errors only when no candidate could be produced or a collaborator failed fatally.
    pub async fn resolve_session(&self, question: &str) -> Result<QuerySession> {
        self.run(question).await.map(|(session, _)| session)
    }

    /// Resolve a question; a critical validation rejection becomes `EngineError::ValidationFailure`.
    pub async fn resolve(&self, question: &str) -> Result<QuerySession> {
        let (session, failure) = self.run(question).await?;
        match failure {
            Some(failure) => Err(EngineError::ValidationFailure(Box::new(failure))),
            None => Ok(session),
        }
    }

    /// Run the validation pipeline on caller-supplied SQL.
    pub async fn validate_sql(&self, sql: &str) -> Result<PipelineVerdict> {
        let schema = self.schema.snapshot().await?;
        Ok(self.pipeline.run(sql, &[], schema).await)
    }

    /// Score a closed session into the feedback store, if one is configured.
    pub async fn record_feedback(&self, session: &QuerySession, user_verdict: Option<bool>) -> Result<Option<FeedbackRecord>> {
        let Some(ref store) = self.feedback else {
            return Ok(None);
        };
        let store = Arc::clone(store);
        let calculator = self.calculator.clone();
        let session = session.clone();
        tokio::task::spawn_blocking(move || store.record(&session, user_verdict, &calculator).map(Some))
            .await
            .map_err(|e| EngineError::Storage(format!("Feedback task failed: {}", e)))?
    }

    async fn record_pattern_outcome(&self, pattern_id: &str, success: bool, elapsed: Duration) -> Result<()> {
        let stats = Arc::clone(&self.stats);
        let pattern_id = pattern_id.to_string();
        tokio::task::spawn_blocking(move || stats.record_outcome(&pattern_id, success, elapsed).map(|_| ()))
            .await
            .map_err(|e| EngineError::Storage(format!("Statistics task failed: {}", e)))?
    }

    async fn run(&self, question: &str) -> Result<(QuerySession, Option<ValidationFailure>)> {
        let started = Instant::now();
        let mut session = QuerySession::open(question);
        let schema = self.schema.snapshot().await?;

        let candidates = match self.match_pattern(question) {
            Some(candidate) => vec![candidate],
            None => self.generate(question, Arc::clone(&schema)).await?,
        };
        let chosen = EnsembleSelector::select(&candidates)
            .cloned()
            .ok_or_else(|| EngineError::GenerationExhausted {
                question: question.to_string(),
                attempted_paths: Vec::new(),
            })?;
        info!(source = %chosen.source, confidence = chosen.confidence, "Selected candidate");

        session.candidates = candidates;
        session.choose(chosen.clone());
        let verdict = self.pipeline.run(&chosen.sql, &session.candidates, schema).await;
        let failure = verdict.failure(&chosen.sql);
        session.close(verdict);

        if let Some(pattern_id) = chosen.source.pattern_id() {
            let elapsed = session
                .execution
                .as_ref()
                .map(|e| Duration::from_millis(e.elapsed_ms))
                .unwrap_or_else(|| started.elapsed());
            if let Err(e) = self.record_pattern_outcome(pattern_id, session.is_accepted(), elapsed).await {
                warn!(pattern = pattern_id, error = %e, "Failed to persist pattern statistics");
            }
        }
        if let Err(e) = self.record_feedback(&session, None).await {
            warn!(session = %session.id, error = %e, "Failed to record feedback");
        }

        info!(
            session = %session.id,
            accepted = session.is_accepted(),
            confidence = session.final_confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resolution finished"
        );
        Ok((session, failure))
    }

    fn match_pattern(&self, question: &str) -> Option<SqlCandidate> {
        if !self.config.pattern_matching_enabled {
            return None;
        }
        let (candidate, pattern) = self.matcher.find_match(question, &self.stats)?;
        info!(
            pattern = %pattern.id,
            confidence = candidate.confidence,
            "Pattern matched; skipping generation paths"
        );
        Some(candidate)
    }

    async fn generate(&self, question: &str, schema: Arc<SchemaMetadata>) -> Result<Vec<SqlCandidate>> {
        if self.generators.is_empty() {
            return Err(EngineError::GenerationExhausted {
                question: question.to_string(),
                attempted_paths: Vec::new(),
            });
        }
        let few_shot = self
            .matcher
            .library()
            .few_shot_examples(question, self.config.few_shot_examples);
        let ctx = Arc::new(GenerationContext::new(schema, few_shot));
        let fan_out = self.generators.generate_all(question, ctx).await;
        if fan_out.candidates.is_empty() {
            return Err(EngineError::GenerationExhausted {
                question: question.to_string(),
                attempted_paths: fan_out.attempted,
            });
        }
        Ok(fan_out.candidates)
    }
}

/// Assembles a `QueryEngine` from its collaborators. Only the schema is required.
pub struct QueryEngineBuilder {
    config: EngineConfig,
    schema: Option<CachedSchemaProvider>,
    patterns: Option<PatternLibrary>,
    stats: Option<StatisticsStore>,
    llm: Option<Arc<dyn LanguageModel>>,
    generators: Option<Vec<Arc<dyn GeneratorPath>>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    rules: BusinessRules,
    feedback: Option<FeedbackStore>,
}

impl QueryEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            schema: None,
            patterns: None,
            stats: None,
            llm: None,
            generators: None,
            executor: None,
            rules: BusinessRules::default(),
            feedback: None,
        }
    }

    pub fn schema(mut self, provider: CachedSchemaProvider) -> Self {
        self.schema = Some(provider);
        self
    }

    pub fn patterns(mut self, library: PatternLibrary) -> Self {
        self.patterns = Some(library);
        self
    }

    pub fn statistics(mut self, store: StatisticsStore) -> Self {
        self.stats = Some(store);
        self
    }

    /// Model used by the standard generation paths listed in `enabled_paths`.
    pub fn language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Replace the standard generation paths.
    pub fn generators(mut self, generators: Vec<Arc<dyn GeneratorPath>>) -> Self {
        self.generators = Some(generators);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn business_rules(mut self, rules: BusinessRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn feedback(mut self, store: FeedbackStore) -> Self {
        self.feedback = Some(store);
        self
    }

    pub fn build(self) -> Result<QueryEngine> {
        self.config.validate()?;
        let schema = self
            .schema
            .ok_or_else(|| EngineError::Configuration("Schema metadata source is required".to_string()))?;
        let library = match self.patterns {
            Some(library) => library,
            None => PatternLibrary::from_records(Vec::new())?,
        };
        let calculator = ConfidenceCalculator::new(self.config.usage_prior_weight);
        let matcher = PatternMatcher::new(Arc::new(library), calculator.clone(), self.config.acceptance_threshold);

        let llm_timeout = self.config.llm_timeout();
        let generators = match (self.generators, self.llm) {
            (Some(generators), _) => GenerationPathSet::new(generators, llm_timeout),
            (None, Some(llm)) => GenerationPathSet::standard(llm, &self.config.enabled_paths, llm_timeout),
            (None, None) => {
                warn!("No language model configured; only pattern matching can answer questions");
                GenerationPathSet::new(Vec::new(), llm_timeout)
            }
        };

        let settings = PipelineSettings {
            dry_run_row_limit: self.config.dry_run_row_limit,
            dry_run_timeout: self.config.dry_run_timeout(),
            self_consistency_threshold: self.config.self_consistency_threshold,
            business_rule_penalty: self.config.business_rule_penalty,
        };
        if self.executor.is_none() {
            warn!("No execution backend configured; dry-run stage will be skipped");
        }
        let pipeline = ValidationPipeline::standard(&settings, Arc::new(self.rules), self.executor);

        Ok(QueryEngine {
            config: self.config,
            schema: Arc::new(schema),
            matcher,
            stats: Arc::new(self.stats.unwrap_or_else(StatisticsStore::in_memory)),
            generators,
            pipeline,
            feedback: self.feedback.map(Arc::new),
            calculator,
        })
    }
}
