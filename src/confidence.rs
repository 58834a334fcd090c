//! Confidence / Reward Calculator
//!
//! Pure functions shared by resolution-time ranking and feedback-time reward.
//! No hidden state: the same inputs always give the same score.

use crate::session::{clamp_unit, GenerationPath};
use crate::stats::PatternStatistics;
use serde::{Deserialize, Serialize};

/// Inputs to the pattern confidence formula.
#[derive(Debug, Clone)]
pub struct PatternSignals {
    /// Fraction of the normalized question covered by the predicate match
    pub coverage: f64,
    /// Fraction of the pattern's keywords present in the question
    pub keyword_overlap: f64,
    pub complexity_weight: u32,
    pub max_complexity_weight: u32,
}

/// How cleanly SQL was pulled out of a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionQuality {
    /// Fenced code block, bare statement, or compiled from a structured plan
    Clean,
    /// Located by scanning free text for a SELECT/WITH keyword
    Heuristic,
}

impl ExtractionQuality {
    fn score(&self) -> f64 {
        match self {
            ExtractionQuality::Clean => 1.0,
            ExtractionQuality::Heuristic => 0.7,
        }
    }
}

/// Inputs to the generation-path confidence formula.
#[derive(Debug, Clone)]
pub struct GenerationSignals {
    pub path: GenerationPath,
    pub extraction: ExtractionQuality,
    /// Fraction of referenced tables/columns found in the schema; `None` if the SQL did not parse
    pub grounding: Option<f64>,
    /// Confidence stated by the model in its response, if any
    pub stated_confidence: Option<f64>,
}

/// Feedback-time signals, each expected in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedbackSignals {
    pub format: f64,
    pub execution: f64,
    pub result: f64,
    pub length: f64,
}

#[derive(Debug, Clone)]
pub struct RewardWeights {
    pub format: f64,
    pub execution: f64,
    pub result: f64,
    pub length: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            format: 0.2,
            execution: 0.3,
            result: 0.4,
            length: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceCalculator {
    usage_prior_weight: f64,
    reward_weights: RewardWeights,
}

impl Default for ConfidenceCalculator {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl ConfidenceCalculator {
    pub fn new(usage_prior_weight: f64) -> Self {
        Self {
            usage_prior_weight: usage_prior_weight.max(0.0),
            reward_weights: RewardWeights::default(),
        }
    }

    /// A predicate hit is strong evidence on its own; coverage lifts it further.
    pub fn predicate_strength(coverage: f64) -> f64 {
        0.5 + 0.5 * clamp_unit(coverage)
    }

    pub fn match_quality(predicate_strength: f64, keyword_overlap: f64) -> f64 {
        clamp_unit(0.6 * clamp_unit(predicate_strength) + 0.4 * clamp_unit(keyword_overlap))
    }

    /// Historical success rate blended with a 0.5 prior; the prior fades as usage grows.
    pub fn usage_frequency(&self, stats: Option<&PatternStatistics>) -> f64 {
        let Some(stats) = stats else {
            return 0.5;
        };
        let usage = stats.usage_count() as f64;
        let rate = stats.success_rate().unwrap_or(0.5);
        let denominator = usage + self.usage_prior_weight;
        let weight = if denominator > 0.0 { usage / denominator } else { 0.0 };
        clamp_unit(weight * rate + (1.0 - weight) * 0.5)
    }

    pub fn normalized_complexity(complexity_weight: u32, max_complexity_weight: u32) -> f64 {
        if max_complexity_weight == 0 {
            return 0.0;
        }
        clamp_unit(complexity_weight as f64 / max_complexity_weight as f64)
    }

    /// `0.5 * match_quality + 0.3 * usage_frequency + 0.2 * (1 - normalized_complexity)`
    pub fn pattern_confidence(&self, signals: &PatternSignals, stats: Option<&PatternStatistics>) -> f64 {
        let quality = Self::match_quality(Self::predicate_strength(signals.coverage), signals.keyword_overlap);
        let usage = self.usage_frequency(stats);
        let complexity = Self::normalized_complexity(signals.complexity_weight, signals.max_complexity_weight);
        clamp_unit(0.5 * quality + 0.3 * usage + 0.2 * (1.0 - complexity))
    }

    pub fn path_prior(path: GenerationPath) -> f64 {
        match path {
            GenerationPath::Direct => 0.60,
            GenerationPath::Intermediate => 0.65,
            GenerationPath::LogicalPlan => 0.70,
        }
    }

    /// `0.4 * extraction + 0.35 * grounding + 0.25 * prior`
    pub fn generation_confidence(&self, signals: &GenerationSignals) -> f64 {
        let grounding = signals.grounding.map(clamp_unit).unwrap_or(0.0);
        let prior = signals
            .stated_confidence
            .map(clamp_unit)
            .unwrap_or_else(|| Self::path_prior(signals.path));
        clamp_unit(0.4 * signals.extraction.score() + 0.35 * grounding + 0.25 * prior)
    }

    /// Product of stage multipliers; an empty pipeline is fully confident.
    pub fn pipeline_confidence<I: IntoIterator<Item = f64>>(multipliers: I) -> f64 {
        multipliers.into_iter().map(clamp_unit).product::<f64>()
    }

    /// `0.2*format + 0.3*execution + 0.4*result + 0.1*length`, each signal clamped first.
    pub fn reward(&self, signals: &FeedbackSignals) -> f64 {
        let w = &self.reward_weights;
        clamp_unit(
            w.format * clamp_unit(signals.format)
                + w.execution * clamp_unit(signals.execution)
                + w.result * clamp_unit(signals.result)
                + w.length * clamp_unit(signals.length),
        )
    }

    /// Penalizes statements that are pathologically short or long.
    pub fn length_signal(sql: &str) -> f64 {
        let tokens = sql.split_whitespace().count();
        match tokens {
            0..=2 => 0.0,
            3 => 0.5,
            4..=400 => 1.0,
            401..=2000 => 1.0 - (tokens - 400) as f64 / 1600.0,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stats(successes: u64, failures: u64) -> PatternStatistics {
        PatternStatistics {
            total_matches: successes + failures,
            successful_executions: successes,
            failed_executions: failures,
            cumulative_execution_ms: 0,
            last_used: Some(Utc::now()),
        }
    }

    fn signals() -> PatternSignals {
        PatternSignals {
            coverage: 0.6,
            keyword_overlap: 1.0,
            complexity_weight: 1,
            max_complexity_weight: 5,
        }
    }

    #[test]
    fn test_pattern_confidence_within_unit_interval() {
        let calc = ConfidenceCalculator::default();
        for coverage in [0.0, 0.3, 1.0, 7.0, -3.0] {
            for overlap in [0.0, 0.5, 1.0, 2.0] {
                for (weight, max) in [(0, 0), (1, 1), (5, 1), (3, 10)] {
                    let s = PatternSignals {
                        coverage,
                        keyword_overlap: overlap,
                        complexity_weight: weight,
                        max_complexity_weight: max,
                    };
                    for st in [None, Some(stats(0, 0)), Some(stats(100, 0)), Some(stats(0, 100))] {
                        let c = calc.pattern_confidence(&s, st.as_ref());
                        assert!((0.0..=1.0).contains(&c), "confidence {} out of range", c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_success_rate_is_monotone() {
        let calc = ConfidenceCalculator::default();
        let mut previous = 0.0;
        for successes in 0..=20 {
            let c = calc.pattern_confidence(&signals(), Some(&stats(successes, 20 - successes)));
            assert!(c >= previous, "confidence dropped from {} to {}", previous, c);
            previous = c;
        }
    }

    #[test]
    fn test_unused_pattern_gets_neutral_usage() {
        let calc = ConfidenceCalculator::default();
        assert_eq!(calc.usage_frequency(None), 0.5);
        assert_eq!(calc.usage_frequency(Some(&stats(0, 0))), 0.5);
        assert!(calc.usage_frequency(Some(&stats(200, 2))) > 0.9);
    }

    #[test]
    fn test_pipeline_confidence_is_product() {
        let product = ConfidenceCalculator::pipeline_confidence([0.9, 0.8, 1.0, 0.5]);
        assert!((product - 0.36).abs() < 1e-9);
        assert_eq!(ConfidenceCalculator::pipeline_confidence([0.9, 0.0, 1.0]), 0.0);
        assert_eq!(ConfidenceCalculator::pipeline_confidence(Vec::<f64>::new()), 1.0);
    }

    #[test]
    fn test_reward_weights_and_clamping() {
        let calc = ConfidenceCalculator::default();
        let perfect = FeedbackSignals { format: 1.0, execution: 1.0, result: 1.0, length: 1.0 };
        assert!((calc.reward(&perfect) - 1.0).abs() < 1e-9);

        let only_result = FeedbackSignals { format: 0.0, execution: 0.0, result: 1.0, length: 0.0 };
        assert!((calc.reward(&only_result) - 0.4).abs() < 1e-9);

        let wild = FeedbackSignals { format: 5.0, execution: -2.0, result: 3.0, length: 9.0 };
        let r = calc.reward(&wild);
        assert!((r - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_generation_confidence_prefers_grounded_sql() {
        let calc = ConfidenceCalculator::default();
        let grounded = GenerationSignals {
            path: GenerationPath::Direct,
            extraction: ExtractionQuality::Clean,
            grounding: Some(1.0),
            stated_confidence: None,
        };
        let ungrounded = GenerationSignals { grounding: Some(0.2), ..grounded.clone() };
        let unparsed = GenerationSignals { grounding: None, ..grounded.clone() };
        assert!(calc.generation_confidence(&grounded) > calc.generation_confidence(&ungrounded));
        assert!(calc.generation_confidence(&ungrounded) > calc.generation_confidence(&unparsed));
        assert!((calc.generation_confidence(&grounded) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_length_signal_extremes() {
        assert_eq!(ConfidenceCalculator::length_signal("SELECT"), 0.0);
        assert_eq!(ConfidenceCalculator::length_signal("SELECT COUNT(*) FROM loans"), 1.0);
        let huge = "x ".repeat(3000);
        assert_eq!(ConfidenceCalculator::length_signal(&huge), 0.0);
    }
}
