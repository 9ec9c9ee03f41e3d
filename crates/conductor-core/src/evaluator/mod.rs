//! Rubric-based scoring of task artifacts.
//!
//! Scoring is a pure function of (artifact, rubric): no clocks, no
//! randomness, no I/O. Each criterion yields a sub-score in `[0, 1]` with
//! partial credit `min(actual / required, 1)`; the composite is the weighted
//! mean. A composite equal to the pass threshold passes.

mod rubric;

pub use rubric::{Check, Criterion, Rubric, RubricError};

use serde::{Deserialize, Serialize};

use crate::evidence::Artifact;

/// Tolerance for threshold comparisons on accumulated floats.
const EPSILON: f64 = 1e-9;

/// Name of the composite metric carried by every result.
pub const COMPOSITE_METRIC: &str = "composite";

/// Score of one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub name: String,
    pub weight: f64,
    pub score: f64,
    pub satisfied: bool,
    pub detail: String,
}

/// Outcome of scoring one artifact against one rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub task_id: String,
    pub attempt: u32,
    pub rubric_id: String,
    pub rubric_version: String,
    pub metric: String,
    pub value: f64,
    pub passed: bool,
    pub rationale: String,
    pub criteria: Vec<CriterionScore>,
}

/// Anything that can score an artifact.
pub trait Evaluator: Send + Sync {
    fn score(&self, artifact: &Artifact, rubric: &Rubric) -> EvaluationResult;
}

/// Default evaluator: evidence-led rubric criteria.
#[derive(Debug, Clone, Copy, Default)]
pub struct RubricEvaluator;

impl RubricEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for RubricEvaluator {
    fn score(&self, artifact: &Artifact, rubric: &Rubric) -> EvaluationResult {
        let criteria: Vec<CriterionScore> = rubric
            .criteria
            .iter()
            .map(|criterion| score_criterion(artifact, criterion))
            .collect();

        let total_weight: f64 = criteria.iter().map(|c| c.weight).sum();
        let value = if total_weight > 0.0 {
            let weighted: f64 = criteria.iter().map(|c| c.weight * c.score).sum();
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let passed = value + EPSILON >= rubric.pass_threshold;

        let rationale = if passed {
            format!(
                "composite {:.3} meets threshold {:.3}",
                value, rubric.pass_threshold
            )
        } else {
            let reasons: Vec<&str> = criteria
                .iter()
                .filter(|c| !c.satisfied)
                .map(|c| c.detail.as_str())
                .collect();
            format!(
                "composite {:.3} below threshold {:.3}: {}",
                value,
                rubric.pass_threshold,
                reasons.join("; ")
            )
        };

        tracing::debug!(
            task_id = %artifact.task_id,
            attempt = artifact.attempt,
            rubric = %rubric.id,
            value,
            passed,
            "Scored artifact"
        );

        EvaluationResult {
            task_id: artifact.task_id.clone(),
            attempt: artifact.attempt,
            rubric_id: rubric.id.clone(),
            rubric_version: rubric.version.clone(),
            metric: COMPOSITE_METRIC.to_string(),
            value,
            passed,
            rationale,
            criteria,
        }
    }
}

fn ratio(actual: usize, required: usize) -> f64 {
    if required == 0 {
        1.0
    } else {
        (actual as f64 / required as f64).min(1.0)
    }
}

fn score_criterion(artifact: &Artifact, criterion: &Criterion) -> CriterionScore {
    let (score, satisfied, detail) = match &criterion.check {
        Check::MinEvidence { count } => {
            let actual = artifact.evidence.len();
            (
                ratio(actual, *count),
                actual >= *count,
                format!("Insufficient evidence: {} of {}", actual, count),
            )
        }

        Check::MinOfKind { kind, count } => {
            let actual = artifact.count_of_kind(kind);
            (
                ratio(actual, *count),
                actual >= *count,
                format!("Insufficient {} evidence: {} of {}", kind, actual, count),
            )
        }

        Check::RequiredKinds { kinds } => {
            let present = artifact.kinds();
            let missing: Vec<&str> = kinds
                .iter()
                .map(String::as_str)
                .filter(|k| !present.contains(k))
                .collect();
            (
                ratio(kinds.len() - missing.len(), kinds.len()),
                missing.is_empty(),
                format!("Missing required evidence types: {}", missing.join(", ")),
            )
        }

        Check::MinMeanQuality { threshold } => {
            let mean = artifact.mean_quality();
            let satisfied = mean + EPSILON >= *threshold;
            let score = if satisfied || *threshold <= 0.0 {
                1.0
            } else {
                (mean / threshold).clamp(0.0, 1.0)
            };
            (
                score,
                satisfied,
                format!("Evidence quality too low: {:.2} < {:.2}", mean, threshold),
            )
        }

        Check::StrengthMix {
            weak,
            medium,
            strong,
        } => {
            let mix = artifact.strength_mix();
            let buckets = [
                (mix.weak, *weak),
                (mix.medium, *medium),
                (mix.strong, *strong),
            ];
            let required: Vec<f64> = buckets
                .iter()
                .filter(|(_, req)| *req > 0)
                .map(|(actual, req)| ratio(*actual, *req))
                .collect();
            let score = if required.is_empty() {
                1.0
            } else {
                required.iter().sum::<f64>() / required.len() as f64
            };
            let satisfied = buckets.iter().all(|(actual, req)| actual >= req);
            (
                score,
                satisfied,
                format!(
                    "Strength mix short: have {}/{}/{} weak/medium/strong, need {}/{}/{}",
                    mix.weak, mix.medium, mix.strong, weak, medium, strong
                ),
            )
        }

        Check::ConvergingSignals { min } => {
            let actual = artifact.converging_signals();
            (
                ratio(actual, *min),
                actual >= *min,
                format!("Too few converging signals: {} of {}", actual, min),
            )
        }

        Check::MinLength { chars } => {
            let actual = artifact.content.chars().count();
            (
                ratio(actual, *chars),
                actual >= *chars,
                format!("Content too short: {} of {} characters", actual, chars),
            )
        }

        Check::RequiredSections { headings } => {
            let lowered = artifact.content.to_lowercase();
            let missing: Vec<&str> = headings
                .iter()
                .filter(|h| !lowered.contains(&h.to_lowercase()))
                .map(String::as_str)
                .collect();
            (
                ratio(headings.len() - missing.len(), headings.len()),
                missing.is_empty(),
                format!("Missing sections: {}", missing.join(", ")),
            )
        }
    };

    CriterionScore {
        name: criterion.check.name().to_string(),
        weight: criterion.weight,
        score,
        satisfied,
        detail: if satisfied { "ok".to_string() } else { detail },
    }
}
