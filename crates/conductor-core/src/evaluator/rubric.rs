//! Rubric definitions.
//!
//! A rubric is a versioned list of weighted criteria plus a pass threshold.
//! Heuristics such as "at least three converging signals" are criteria
//! parameters, never constants baked into the scorer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from rubric validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RubricError {
    #[error("rubric id must not be empty")]
    MissingId,

    #[error("rubric '{rubric}': pass_threshold {value} must be within [0, 1]")]
    ThresholdOutOfRange { rubric: String, value: f64 },

    #[error("rubric '{0}' has no criteria")]
    NoCriteria(String),

    #[error("rubric '{rubric}': criterion {index} is invalid: {reason}")]
    InvalidCriterion {
        rubric: String,
        index: usize,
        reason: String,
    },
}

fn default_version() -> String {
    "1".to_string()
}

fn default_weight() -> f64 {
    1.0
}

/// A scoring rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    /// Unique identifier (e.g., "desirability-gate")
    pub id: String,

    /// Version string; results carry it for reproducibility
    #[serde(default = "default_version")]
    pub version: String,

    /// Composite score required to accept, in [0, 1]
    pub pass_threshold: f64,

    /// Weighted criteria
    pub criteria: Vec<Criterion>,
}

/// A single weighted criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(flatten)]
    pub check: Check,
}

impl Criterion {
    pub fn new(check: Check) -> Self {
        Self { weight: 1.0, check }
    }

    pub fn weighted(check: Check, weight: f64) -> Self {
        Self { weight, check }
    }
}

/// What a criterion measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// At least `count` evidence items of any kind
    MinEvidence { count: usize },

    /// At least `count` evidence items of `kind`
    MinOfKind { kind: String, count: usize },

    /// Every listed kind is present at least once
    RequiredKinds { kinds: Vec<String> },

    /// Mean evidence quality at or above `threshold`
    MinMeanQuality { threshold: f64 },

    /// Per-strength minimum counts
    StrengthMix {
        #[serde(default)]
        weak: usize,
        #[serde(default)]
        medium: usize,
        #[serde(default)]
        strong: usize,
    },

    /// Distinct kinds with medium-or-stronger support
    ConvergingSignals { min: usize },

    /// Content length in characters
    MinLength { chars: usize },

    /// Headings or phrases the content must contain (case-insensitive)
    RequiredSections { headings: Vec<String> },
}

impl Check {
    /// Short stable name used in result breakdowns.
    pub fn name(&self) -> &'static str {
        match self {
            Check::MinEvidence { .. } => "min_evidence",
            Check::MinOfKind { .. } => "min_of_kind",
            Check::RequiredKinds { .. } => "required_kinds",
            Check::MinMeanQuality { .. } => "min_mean_quality",
            Check::StrengthMix { .. } => "strength_mix",
            Check::ConvergingSignals { .. } => "converging_signals",
            Check::MinLength { .. } => "min_length",
            Check::RequiredSections { .. } => "required_sections",
        }
    }
}

impl Rubric {
    /// Validate thresholds, weights and criterion parameters.
    pub fn validate(&self) -> Result<(), RubricError> {
        if self.id.trim().is_empty() {
            return Err(RubricError::MissingId);
        }

        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(RubricError::ThresholdOutOfRange {
                rubric: self.id.clone(),
                value: self.pass_threshold,
            });
        }

        if self.criteria.is_empty() {
            return Err(RubricError::NoCriteria(self.id.clone()));
        }

        for (index, criterion) in self.criteria.iter().enumerate() {
            let invalid = |reason: &str| RubricError::InvalidCriterion {
                rubric: self.id.clone(),
                index,
                reason: reason.to_string(),
            };

            if !criterion.weight.is_finite() || criterion.weight <= 0.0 {
                return Err(invalid("weight must be a positive number"));
            }

            match &criterion.check {
                Check::MinMeanQuality { threshold } if !(0.0..=1.0).contains(threshold) => {
                    return Err(invalid("quality threshold must be within [0, 1]"));
                }
                Check::RequiredKinds { kinds } if kinds.is_empty() => {
                    return Err(invalid("required_kinds needs at least one kind"));
                }
                Check::RequiredSections { headings } if headings.is_empty() => {
                    return Err(invalid("required_sections needs at least one heading"));
                }
                Check::MinOfKind { kind, .. } if kind.trim().is_empty() => {
                    return Err(invalid("min_of_kind needs a kind"));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATE_RUBRIC: &str = r#"
id: desirability-gate
version: "2"
pass_threshold: 0.8
criteria:
  - type: min_evidence
    count: 10
  - type: min_of_kind
    kind: experiment
    count: 5
    weight: 2.0
  - type: required_kinds
    kinds: [interview, analytics, experiment]
  - type: min_mean_quality
    threshold: 0.7
  - type: strength_mix
    strong: 2
    medium: 3
  - type: converging_signals
    min: 3
"#;

    #[test]
    fn test_parse_rubric_yaml() {
        let rubric: Rubric = serde_yaml::from_str(GATE_RUBRIC).unwrap();
        assert_eq!(rubric.version, "2");
        assert_eq!(rubric.criteria.len(), 6);
        assert_eq!(rubric.criteria[1].weight, 2.0);
        assert_eq!(rubric.criteria[0].weight, 1.0);
        assert!(matches!(
            rubric.criteria[4].check,
            Check::StrengthMix { weak: 0, medium: 3, strong: 2 }
        ));
        assert!(rubric.validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let rubric = Rubric {
            id: "r".into(),
            version: "1".into(),
            pass_threshold: 1.5,
            criteria: vec![Criterion::new(Check::MinEvidence { count: 1 })],
        };
        assert!(matches!(
            rubric.validate(),
            Err(RubricError::ThresholdOutOfRange { .. })
        ));
    }

    #[test]
    fn test_zero_weight_rejected() {
        let rubric = Rubric {
            id: "r".into(),
            version: "1".into(),
            pass_threshold: 0.5,
            criteria: vec![Criterion::weighted(Check::MinLength { chars: 10 }, 0.0)],
        };
        assert!(matches!(
            rubric.validate(),
            Err(RubricError::InvalidCriterion { index: 0, .. })
        ));
    }

    #[test]
    fn test_empty_criteria_rejected() {
        let rubric = Rubric {
            id: "r".into(),
            version: "1".into(),
            pass_threshold: 0.5,
            criteria: vec![],
        };
        assert_eq!(rubric.validate(), Err(RubricError::NoCriteria("r".into())));
    }
}
