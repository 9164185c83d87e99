//! Triage scoring for admission priority.

use serde::{Deserialize, Serialize};

use super::types::{ScoringFactors, WorkItem};

/// Configurable weights for the triage score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageWeights {
    pub complexity: f64,
    pub impact: f64,
    pub priority: f64,
    pub age: f64,
    pub dependency_pressure: f64,
    pub memory_signal: f64,
}

impl Default for TriageWeights {
    fn default() -> Self {
        Self {
            complexity: -0.5,
            impact: 1.0,
            priority: 2.0,
            age: 0.25,
            dependency_pressure: 0.75,
            memory_signal: 0.5,
        }
    }
}

/// Weighted sum of the scoring factors.
pub fn triage_score(factors: &ScoringFactors, weights: &TriageWeights) -> f64 {
    factors.complexity * weights.complexity
        + factors.impact * weights.impact
        + factors.priority * weights.priority
        + factors.age * weights.age
        + factors.dependency_pressure * weights.dependency_pressure
        + factors.memory_signal * weights.memory_signal
}

/// Score and sort candidates, best first.
///
/// Ties break on item id so the order is deterministic across polls.
pub fn rank_candidates(mut items: Vec<WorkItem>, weights: &TriageWeights) -> Vec<WorkItem> {
    for item in &mut items {
        item.triage_score = triage_score(&item.factors, weights);
    }
    items.sort_by(|a, b| {
        b.triage_score
            .partial_cmp(&a.triage_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    items
}
