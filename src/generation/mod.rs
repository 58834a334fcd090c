//! Generation Path Set
//!
//! Independent strategies that ask the language model for SQL when no pattern
//! is good enough. `GenerationPathSet` runs every enabled path concurrently
//! with a per-path timeout and keeps whatever candidates come back.

pub mod direct;
pub mod ensemble;
pub mod intermediate;
pub mod logical_plan;

pub use direct::DirectPath;
pub use ensemble::EnsembleSelector;
pub use intermediate::IntermediatePath;
pub use logical_plan::{LogicalPlan, LogicalPlanPath, PlanCompiler};

use crate::confidence::{ConfidenceCalculator, ExtractionQuality, GenerationSignals};
use crate::error::Result;
use crate::llm::{stated_confidence, FewShotExample, LanguageModel};
use crate::metadata::SchemaMetadata;
use crate::session::{CandidateSource, GenerationPath, SqlCandidate};
use crate::validation::schema::grounding;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Everything a path needs about the question's environment. Built once per resolution.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub schema: Arc<SchemaMetadata>,
    /// Prompt rendering of `schema`
    pub schema_context: String,
    pub few_shot: Vec<FewShotExample>,
}

impl GenerationContext {
    pub fn new(schema: Arc<SchemaMetadata>, few_shot: Vec<FewShotExample>) -> Self {
        let schema_context = schema.render_context();
        Self {
            schema,
            schema_context,
            few_shot,
        }
    }
}

#[async_trait]
pub trait GeneratorPath: Send + Sync {
    fn path(&self) -> GenerationPath;

    async fn generate(&self, question: &str, ctx: &GenerationContext) -> Result<SqlCandidate>;
}

/// Score extracted SQL and wrap it as a candidate of `path`.
pub(crate) fn scored_candidate(
    path: GenerationPath,
    sql: String,
    extraction: ExtractionQuality,
    response: &str,
    reasoning: String,
    ctx: &GenerationContext,
) -> SqlCandidate {
    let signals = GenerationSignals {
        path,
        extraction,
        grounding: grounding(&sql, &ctx.schema),
        stated_confidence: stated_confidence(response),
    };
    let confidence = ConfidenceCalculator::default().generation_confidence(&signals);
    debug!(path = %path, confidence, grounding = ?signals.grounding, "Scored generated SQL");
    SqlCandidate::new(CandidateSource::Path(path), sql, confidence, reasoning)
}

/// Candidates from one fan-out, plus the names of every path that was tried.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    pub candidates: Vec<SqlCandidate>,
    pub attempted: Vec<String>,
}

/// Ordered registry of generation paths.
pub struct GenerationPathSet {
    generators: Vec<Arc<dyn GeneratorPath>>,
    timeout: Duration,
}

impl GenerationPathSet {
    pub fn new(generators: Vec<Arc<dyn GeneratorPath>>, timeout: Duration) -> Self {
        Self { generators, timeout }
    }

    /// The built-in strategies for `enabled`, in the order given.
    pub fn standard(llm: Arc<dyn LanguageModel>, enabled: &[GenerationPath], timeout: Duration) -> Self {
        let generators = enabled
            .iter()
            .map(|path| -> Arc<dyn GeneratorPath> {
                match path {
                    GenerationPath::Direct => Arc::new(DirectPath::new(Arc::clone(&llm))),
                    GenerationPath::Intermediate => Arc::new(IntermediatePath::new(Arc::clone(&llm))),
                    GenerationPath::LogicalPlan => Arc::new(LogicalPlanPath::new(Arc::clone(&llm))),
                }
            })
            .collect();
        Self::new(generators, timeout)
    }

    pub fn paths(&self) -> Vec<GenerationPath> {
        self.generators.iter().map(|g| g.path()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Run every path concurrently. A path that errors or exceeds the timeout is
    /// logged and left out; candidates come back in registry order.
    pub async fn generate_all(&self, question: &str, ctx: Arc<GenerationContext>) -> FanOut {
        let attempted: Vec<String> = self.generators.iter().map(|g| g.path().name().to_string()).collect();
        let mut tasks = JoinSet::new();

        for (index, generator) in self.generators.iter().enumerate() {
            let generator = Arc::clone(generator);
            let ctx = Arc::clone(&ctx);
            let question = question.to_string();
            let limit = self.timeout;
            tasks.spawn(async move {
                let path = generator.path();
                let outcome = tokio::time::timeout(limit, generator.generate(&question, &ctx)).await;
                (index, path, outcome)
            });
        }

        let mut produced = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(Ok(candidate)))) => produced.push((index, candidate)),
                Ok((_, path, Ok(Err(e)))) => warn!(path = %path, error = %e, "Generation path failed"),
                Ok((_, path, Err(_))) => {
                    warn!(path = %path, timeout_secs = self.timeout.as_secs_f64(), "Generation path timed out")
                }
                Err(e) => warn!(error = %e, "Generation task aborted"),
            }
        }
        produced.sort_by_key(|(index, _)| *index);

        let candidates: Vec<SqlCandidate> = produced.into_iter().map(|(_, c)| c).collect();
        info!(
            attempted = attempted.len(),
            produced = candidates.len(),
            "Generation fan-out finished"
        );
        FanOut { candidates, attempted }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{EngineError, ServiceFailureKind};
    use crate::llm::LlmRequest;
    use crate::metadata::tests::loan_schema;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned responses in order and counts calls.
    pub(crate) struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedModel {
        pub(crate) fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|r| r.to_string()).collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _request: &LlmRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| EngineError::llm(ServiceFailureKind::InvalidResponse, "script exhausted"))
        }
    }

    pub(crate) fn context() -> Arc<GenerationContext> {
        Arc::new(GenerationContext::new(Arc::new(loan_schema()), Vec::new()))
    }

    struct Fixed(GenerationPath, &'static str);

    #[async_trait]
    impl GeneratorPath for Fixed {
        fn path(&self) -> GenerationPath {
            self.0
        }

        async fn generate(&self, _question: &str, _ctx: &GenerationContext) -> Result<SqlCandidate> {
            Ok(SqlCandidate::new(CandidateSource::Path(self.0), self.1, 0.8, ""))
        }
    }

    struct Failing;

    #[async_trait]
    impl GeneratorPath for Failing {
        fn path(&self) -> GenerationPath {
            GenerationPath::Intermediate
        }

        async fn generate(&self, _question: &str, _ctx: &GenerationContext) -> Result<SqlCandidate> {
            Err(EngineError::llm(ServiceFailureKind::Network, "connection refused"))
        }
    }

    struct Slow;

    #[async_trait]
    impl GeneratorPath for Slow {
        fn path(&self) -> GenerationPath {
            GenerationPath::LogicalPlan
        }

        async fn generate(&self, _question: &str, _ctx: &GenerationContext) -> Result<SqlCandidate> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(SqlCandidate::new(CandidateSource::Path(GenerationPath::LogicalPlan), "SELECT 1", 1.0, ""))
        }
    }

    #[tokio::test]
    async fn test_failed_and_slow_paths_are_excluded() {
        let set = GenerationPathSet::new(
            vec![
                Arc::new(Fixed(GenerationPath::Direct, "SELECT COUNT(*) FROM loans")),
                Arc::new(Failing),
                Arc::new(Slow),
            ],
            Duration::from_millis(50),
        );
        let fan_out = set.generate_all("how many loans", context()).await;
        assert_eq!(fan_out.candidates.len(), 1);
        assert_eq!(fan_out.candidates[0].source, CandidateSource::Path(GenerationPath::Direct));
        assert_eq!(fan_out.attempted, vec!["direct", "intermediate", "logical_plan"]);
    }

    #[tokio::test]
    async fn test_candidates_in_registry_order() {
        let set = GenerationPathSet::new(
            vec![
                Arc::new(Fixed(GenerationPath::LogicalPlan, "SELECT 2")),
                Arc::new(Fixed(GenerationPath::Direct, "SELECT 1")),
            ],
            Duration::from_secs(1),
        );
        let fan_out = set.generate_all("q", context()).await;
        let sql: Vec<&str> = fan_out.candidates.iter().map(|c| c.sql.as_str()).collect();
        assert_eq!(sql, vec!["SELECT 2", "SELECT 1"]);
    }

    #[test]
    fn test_standard_follows_enabled_order() {
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(&[]));
        let set = GenerationPathSet::standard(
            llm,
            &[GenerationPath::LogicalPlan, GenerationPath::Direct],
            Duration::from_secs(1),
        );
        assert_eq!(set.paths(), vec![GenerationPath::LogicalPlan, GenerationPath::Direct]);
    }
}
