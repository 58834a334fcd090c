//! Ensemble Selector: pick exactly one candidate, independent of arrival order.

use crate::session::SqlCandidate;
use std::cmp::Ordering;

pub struct EnsembleSelector;

impl EnsembleSelector {
    /// Highest confidence wins; ties go to the faster source
    /// (pattern, direct, intermediate, logical plan), then to the lexicographically
    /// smaller SQL text. `None` only for an empty slice.
    pub fn select(candidates: &[SqlCandidate]) -> Option<&SqlCandidate> {
        candidates.iter().min_by(|a, b| Self::rank(a, b))
    }

    fn rank(a: &SqlCandidate, b: &SqlCandidate) -> Ordering {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.source.tie_break_rank().cmp(&b.source.tie_break_rank()))
            .then_with(|| a.sql.cmp(&b.sql))
    }
}
