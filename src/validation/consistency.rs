//! Stage 5: agreement between the chosen SQL and the other candidates for the same question.

use super::analysis::{jaccard, parse_query, QueryAnalysis};
use super::{Stage, ValidationContext, ValidationResult, Validator};
use crate::session::SqlCandidate;
use async_trait::async_trait;
use std::collections::BTreeSet;

const TABLE_WEIGHT: f64 = 0.6;
const AGGREGATE_WEIGHT: f64 = 0.4;

pub struct SelfConsistencyValidator {
    threshold: f64,
}

impl SelfConsistencyValidator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

struct Shape {
    tables: BTreeSet<String>,
    aggregates: BTreeSet<String>,
}

impl Shape {
    fn of(sql: &str) -> Option<Self> {
        let analysis = QueryAnalysis::of(&parse_query(sql)?);
        Some(Self {
            tables: analysis.table_names(),
            aggregates: analysis.aggregates,
        })
    }

    fn agreement(&self, other: &Shape) -> f64 {
        TABLE_WEIGHT * jaccard(&self.tables, &other.tables) + AGGREGATE_WEIGHT * jaccard(&self.aggregates, &other.aggregates)
    }
}

#[async_trait]
impl Validator for SelfConsistencyValidator {
    fn stage(&self) -> Stage {
        Stage::SelfConsistency
    }

    async fn validate(&self, sql: &str, candidates: &[SqlCandidate], _ctx: &ValidationContext) -> ValidationResult {
        let mut others: Vec<&SqlCandidate> = candidates.iter().collect();
        if let Some(pos) = others.iter().position(|c| c.sql == sql) {
            others.remove(pos);
        }
        if others.is_empty() {
            return ValidationResult::pass(Stage::SelfConsistency);
        }
        let Some(chosen) = Shape::of(sql) else {
            return ValidationResult::pass(Stage::SelfConsistency);
        };

        let mut warnings = Vec::new();
        let mut scores = Vec::with_capacity(others.len());
        for other in others {
            match Shape::of(&other.sql) {
                Some(shape) => scores.push(chosen.agreement(&shape)),
                None => warnings.push(format!("Candidate from {} could not be parsed for comparison", other.source)),
            }
        }
        if scores.is_empty() {
            return ValidationResult::pass(Stage::SelfConsistency).with_warnings(warnings);
        }

        let agreement = scores.iter().sum::<f64>() / scores.len() as f64;
        let mut result = ValidationResult::pass(Stage::SelfConsistency)
            .with_multiplier(0.5 + 0.5 * agreement)
            .with_warnings(warnings);
        if agreement < self.threshold {
            result.passed = false;
            result.warnings.push(format!(
                "Candidates disagree on tables or aggregates (agreement {:.2})",
                agreement
            ));
            result = result.with_suggestions(vec!["Rephrase the question to name the measure and entity".to_string()]);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GenerationPath;
    use crate::validation::tests::{candidate, ctx};

    const CHOSEN: &str = "SELECT COUNT(*) FROM loans WHERE status = 'active'";

    #[tokio::test]
    async fn test_single_candidate_passes() {
        let candidates = vec![candidate(GenerationPath::Direct, CHOSEN)];
        let result = SelfConsistencyValidator::new(0.5).validate(CHOSEN, &candidates, &ctx()).await;
        assert!(result.passed);
        assert_eq!(result.confidence_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_full_agreement() {
        let candidates = vec![
            candidate(GenerationPath::Direct, CHOSEN),
            candidate(GenerationPath::Intermediate, "SELECT COUNT(loan_id) FROM loans WHERE status = 'active'"),
        ];
        let result = SelfConsistencyValidator::new(0.5).validate(CHOSEN, &candidates, &ctx()).await;
        assert!(result.passed);
        assert_eq!(result.confidence_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_disagreement_lowers_confidence() {
        let candidates = vec![
            candidate(GenerationPath::Direct, CHOSEN),
            candidate(GenerationPath::LogicalPlan, "SELECT city FROM customers"),
        ];
        let result = SelfConsistencyValidator::new(0.5).validate(CHOSEN, &candidates, &ctx()).await;
        assert!(!result.passed);
        assert!((result.confidence_multiplier - 0.5).abs() < 1e-9);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_candidate_is_skipped() {
        let candidates = vec![
            candidate(GenerationPath::Direct, CHOSEN),
            candidate(GenerationPath::Intermediate, "this is not sql"),
        ];
        let result = SelfConsistencyValidator::new(0.5).validate(CHOSEN, &candidates, &ctx()).await;
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 1);
    }
}
