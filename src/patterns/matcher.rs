//! Pattern Matching Engine
//!
//! Deterministic first pass: scores every pattern whose predicate fires and
//! returns the best one if it clears the acceptance threshold. Reads
//! statistics but never writes them.

use super::library::{normalize_question, Pattern, PatternLibrary};
use crate::confidence::{ConfidenceCalculator, PatternSignals};
use crate::session::{CandidateSource, SqlCandidate};
use crate::stats::StatisticsStore;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// A scored predicate hit.
#[derive(Debug, Clone)]
pub struct PatternScore {
    pub pattern_id: String,
    pub confidence: f64,
    pub sql: String,
}

pub struct PatternMatcher {
    library: Arc<PatternLibrary>,
    calculator: ConfidenceCalculator,
    acceptance_threshold: f64,
}

impl PatternMatcher {
    pub fn new(library: Arc<PatternLibrary>, calculator: ConfidenceCalculator, acceptance_threshold: f64) -> Self {
        Self {
            library,
            calculator,
            acceptance_threshold,
        }
    }

    pub fn library(&self) -> &PatternLibrary {
        &self.library
    }

    /// Score every pattern whose predicate fires, best first.
    pub fn score_all(&self, question: &str, stats: &StatisticsStore) -> Vec<PatternScore> {
        let normalized = normalize_question(question);
        if normalized.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(&Pattern, PatternScore)> = Vec::new();
        for pattern in self.library.patterns() {
            let Some(caps) = pattern.predicate.captures(&normalized) else {
                continue;
            };
            let sql = match pattern.bind(&caps) {
                Ok(sql) => sql,
                Err(e) => {
                    warn!(pattern = %pattern.id, "Skipping pattern: {}", e);
                    continue;
                }
            };
            let matched_len = caps.get(0).map(|m| m.as_str().len()).unwrap_or(0);
            let signals = PatternSignals {
                coverage: matched_len as f64 / normalized.len() as f64,
                keyword_overlap: pattern.keyword_overlap(&normalized),
                complexity_weight: pattern.complexity_weight,
                max_complexity_weight: self.library.max_complexity_weight(),
            };
            let pattern_stats = stats.get(&pattern.id);
            let confidence = self.calculator.pattern_confidence(&signals, pattern_stats.as_ref());
            debug!(pattern = %pattern.id, confidence, "Pattern predicate matched");
            scored.push((
                pattern,
                PatternScore {
                    pattern_id: pattern.id.clone(),
                    confidence,
                    sql,
                },
            ));
        }

        scored.sort_by(|a, b| compare_hits(a.0, &a.1, b.0, &b.1));
        scored.into_iter().map(|(_, score)| score).collect()
    }

    /// Best acceptable match, or `None` to fall through to generation.
    pub fn find_match(&self, question: &str, stats: &StatisticsStore) -> Option<(SqlCandidate, &Pattern)> {
        let best = self.score_all(question, stats).into_iter().next()?;
        if best.confidence < self.acceptance_threshold {
            debug!(
                pattern = %best.pattern_id,
                confidence = best.confidence,
                threshold = self.acceptance_threshold,
                "Best pattern below acceptance threshold"
            );
            return None;
        }
        let pattern = self.library.get(&best.pattern_id)?;
        let candidate = SqlCandidate::new(
            CandidateSource::Pattern(pattern.id.clone()),
            best.sql,
            best.confidence,
            format!("Matched pattern '{}' ({})", pattern.id, pattern.category),
        );
        Some((candidate, pattern))
    }
}

/// Higher confidence first, then lower complexity, then library order.
fn compare_hits(pa: &Pattern, a: &PatternScore, pb: &Pattern, b: &PatternScore) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(pa.complexity_weight.cmp(&pb.complexity_weight))
        .then(pa.order.cmp(&pb.order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::library::tests::loan_library;
    use crate::patterns::PatternRecord;
    use std::collections::HashMap;
    use std::time::Duration;

    fn matcher(library: PatternLibrary, threshold: f64) -> PatternMatcher {
        PatternMatcher::new(Arc::new(library), ConfidenceCalculator::default(), threshold)
    }

    fn record(id: &str, predicate: &str, complexity: u32) -> PatternRecord {
        PatternRecord {
            id: id.to_string(),
            predicate: predicate.to_string(),
            template: format!("SELECT '{}' AS source FROM loans", id),
            keywords: Vec::new(),
            complexity_weight: complexity,
            category: "test".to_string(),
            examples: Vec::new(),
            defaults: HashMap::new(),
        }
    }

    #[test]
    fn test_active_loan_question_matches() {
        let m = matcher(loan_library(), 0.6);
        let stats = StatisticsStore::in_memory();
        let (candidate, pattern) = m.find_match("How many active loans do we have?", &stats).unwrap();
        assert_eq!(pattern.id, "active_loan_count");
        assert!(candidate.sql.starts_with("SELECT COUNT(*)"));
        assert!(candidate.confidence >= 0.7, "confidence {}", candidate.confidence);
    }

    #[test]
    fn test_no_predicate_hit_returns_none() {
        let m = matcher(loan_library(), 0.6);
        let stats = StatisticsStore::in_memory();
        assert!(m.find_match("DROP TABLE customers", &stats).is_none());
        assert!(m.find_match("   ", &stats).is_none());
    }

    #[test]
    fn test_threshold_rejects_weak_match() {
        let m = matcher(loan_library(), 0.99);
        let stats = StatisticsStore::in_memory();
        assert!(m.find_match("How many active loans do we have?", &stats).is_none());
    }

    #[test]
    fn test_history_raises_confidence() {
        let m = matcher(loan_library(), 0.0);
        let stats = StatisticsStore::in_memory();
        let before = m.find_match("how many active loans", &stats).unwrap().0.confidence;
        for _ in 0..50 {
            stats
                .record_outcome("active_loan_count", true, Duration::from_millis(3))
                .unwrap();
        }
        let after = m.find_match("how many active loans", &stats).unwrap().0.confidence;
        assert!(after > before);
    }

    #[test]
    fn test_ties_break_on_complexity_then_order() {
        let library = PatternLibrary::from_records(vec![
            record("complex", "loans", 3),
            record("simple_first", "loans", 1),
            record("simple_second", "loans", 1),
        ])
        .unwrap();
        // Identical predicates and keywords; complexity differs, so the simple ones score higher.
        let m = matcher(library, 0.0);
        let stats = StatisticsStore::in_memory();
        let (_, pattern) = m.find_match("loans", &stats).unwrap();
        assert_eq!(pattern.id, "simple_first");

        let all = m.score_all("loans", &stats);
        assert_eq!(all.last().unwrap().pattern_id, "complex");
    }

    #[test]
    fn test_scores_are_deterministic() {
        let m = matcher(loan_library(), 0.0);
        let stats = StatisticsStore::in_memory();
        let first: Vec<_> = m.score_all("top 3 loans by balance", &stats).into_iter().map(|s| (s.pattern_id, s.sql)).collect();
        let second: Vec<_> = m.score_all("top 3 loans by balance", &stats).into_iter().map(|s| (s.pattern_id, s.sql)).collect();
        assert_eq!(first, second);
        assert!(first[0].1.ends_with("LIMIT 3"));
    }
}
