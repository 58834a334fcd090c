//! Candidates and query sessions
//!
//! A session is opened per question and closed once a verdict is reached.
//! It is the unit fed to the statistics store and to feedback collection.

use crate::execution::ExecutionOutcome;
use crate::validation::{PipelineVerdict, ValidationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Language-model driven generation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPath {
    Direct,
    Intermediate,
    LogicalPlan,
}

impl GenerationPath {
    pub const ALL: [GenerationPath; 3] = [
        GenerationPath::Direct,
        GenerationPath::Intermediate,
        GenerationPath::LogicalPlan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GenerationPath::Direct => "direct",
            GenerationPath::Intermediate => "intermediate",
            GenerationPath::LogicalPlan => "logical_plan",
        }
    }
}

impl fmt::Display for GenerationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CandidateSource {
    Pattern(String),
    Path(GenerationPath),
}

impl CandidateSource {
    /// Selection rank on confidence ties; lower wins.
    pub fn tie_break_rank(&self) -> u8 {
        match self {
            CandidateSource::Pattern(_) => 0,
            CandidateSource::Path(GenerationPath::Direct) => 1,
            CandidateSource::Path(GenerationPath::Intermediate) => 2,
            CandidateSource::Path(GenerationPath::LogicalPlan) => 3,
        }
    }

    pub fn pattern_id(&self) -> Option<&str> {
        match self {
            CandidateSource::Pattern(id) => Some(id),
            CandidateSource::Path(_) => None,
        }
    }
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSource::Pattern(id) => write!(f, "pattern:{}", id),
            CandidateSource::Path(path) => write!(f, "path:{}", path),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub source: CandidateSource,
    pub sql: String,
    /// Always within [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub estimated_cost: Option<f64>,
}

impl SqlCandidate {
    pub fn new(source: CandidateSource, sql: impl Into<String>, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            source,
            sql: sql.into(),
            confidence: clamp_unit(confidence),
            reasoning: reasoning.into(),
            estimated_cost: None,
        }
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Pending,
    Accepted,
    Rejected { stage: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySession {
    pub id: Uuid,
    pub question: String,
    /// Every candidate produced for the question, in selection order
    pub candidates: Vec<SqlCandidate>,
    chosen: Option<SqlCandidate>,
    pub validation_trace: Vec<ValidationResult>,
    pub final_confidence: f64,
    pub execution: Option<ExecutionOutcome>,
    pub outcome: SessionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QuerySession {
    pub fn open(question: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            candidates: Vec::new(),
            chosen: None,
            validation_trace: Vec::new(),
            final_confidence: 0.0,
            execution: None,
            outcome: SessionOutcome::Pending,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the chosen candidate. A session holds at most one; later calls replace it.
    pub fn choose(&mut self, candidate: SqlCandidate) {
        self.chosen = Some(candidate);
    }

    pub fn chosen(&self) -> Option<&SqlCandidate> {
        self.chosen.as_ref()
    }

    /// Close the session with the pipeline verdict.
    pub fn close(&mut self, verdict: PipelineVerdict) {
        let candidate_confidence = self.chosen.as_ref().map(|c| c.confidence).unwrap_or(0.0);
        self.final_confidence = clamp_unit(candidate_confidence * verdict.overall_confidence);
        self.execution = verdict.dry_run.clone();
        self.outcome = match &verdict.failed_stage {
            Some(stage) => SessionOutcome::Rejected { stage: stage.clone() },
            None => SessionOutcome::Accepted,
        };
        self.validation_trace = verdict.results;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Accepted)
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_confidence_is_clamped() {
        let high = SqlCandidate::new(CandidateSource::Path(GenerationPath::Direct), "SELECT 1", 1.7, "");
        let low = SqlCandidate::new(CandidateSource::Path(GenerationPath::Direct), "SELECT 1", -0.2, "");
        let nan = SqlCandidate::new(CandidateSource::Path(GenerationPath::Direct), "SELECT 1", f64::NAN, "");
        assert_eq!(high.confidence, 1.0);
        assert_eq!(low.confidence, 0.0);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_tie_break_rank_prefers_lower_latency_paths() {
        let pattern = CandidateSource::Pattern("p".to_string());
        let direct = CandidateSource::Path(GenerationPath::Direct);
        let intermediate = CandidateSource::Path(GenerationPath::Intermediate);
        let plan = CandidateSource::Path(GenerationPath::LogicalPlan);
        assert!(pattern.tie_break_rank() < direct.tie_break_rank());
        assert!(direct.tie_break_rank() < intermediate.tie_break_rank());
        assert!(intermediate.tie_break_rank() < plan.tie_break_rank());
    }

    #[test]
    fn test_session_holds_single_chosen_candidate() {
        let mut session = QuerySession::open("how many loans?");
        session.choose(SqlCandidate::new(CandidateSource::Path(GenerationPath::Direct), "SELECT 1", 0.5, ""));
        session.choose(SqlCandidate::new(CandidateSource::Path(GenerationPath::LogicalPlan), "SELECT 2", 0.6, ""));
        assert_eq!(session.chosen().map(|c| c.sql.as_str()), Some("SELECT 2"));
    }
}
