//! Shared vocabulary: task types, PII levels, budget tiers, context policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a job, as supplied by the intake command.
pub type JobId = String;

/// Identifier of a task, unique within its job's graph.
pub type TaskId = String;

/// Error returned when parsing one of the vocabulary enums from text.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown {kind} '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Kind of agent work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Draft or generate deliverable content
    Generate,
    /// Collect evidence (research, analytics, experiments)
    Evidence,
    /// Evaluate or validate a produced artifact
    Evaluate,
    /// Render/export a deliverable
    Render,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Generate,
        TaskType::Evidence,
        TaskType::Evaluate,
        TaskType::Render,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Generate => "generate",
            TaskType::Evidence => "evidence",
            TaskType::Evaluate => "evaluate",
            TaskType::Render => "render",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "task type",
                value: s.to_string(),
                expected: "generate, evidence, evaluate, render",
            })
    }
}

/// Sensitivity of the personal data a job may touch.
///
/// Ordered from least to most sensitive so policies can match "at most".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiLevel {
    None,
    Low,
    Moderate,
    High,
}

impl PiiLevel {
    pub const ALL: [PiiLevel; 4] = [
        PiiLevel::None,
        PiiLevel::Low,
        PiiLevel::Moderate,
        PiiLevel::High,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiLevel::None => "none",
            PiiLevel::Low => "low",
            PiiLevel::Moderate => "moderate",
            PiiLevel::High => "high",
        }
    }
}

impl fmt::Display for PiiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PiiLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PiiLevel::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "pii level",
                value: s.to_string(),
                expected: "none, low, moderate, high",
            })
    }
}

/// Budget/quality class governing cost and latency ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    Economy,
    Standard,
    Premium,
}

impl BudgetTier {
    pub const ALL: [BudgetTier; 3] = [BudgetTier::Economy, BudgetTier::Standard, BudgetTier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetTier::Economy => "economy",
            BudgetTier::Standard => "standard",
            BudgetTier::Premium => "premium",
        }
    }

    /// The next cheaper tier, if any.
    pub fn downgrade(&self) -> Option<BudgetTier> {
        match self {
            BudgetTier::Premium => Some(BudgetTier::Standard),
            BudgetTier::Standard => Some(BudgetTier::Economy),
            BudgetTier::Economy => None,
        }
    }
}

impl fmt::Display for BudgetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BudgetTier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "budget tier",
                value: s.to_string(),
                expected: "economy, standard, premium",
            })
    }
}

/// What a provider response may contain, enforced on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// No content restrictions
    Open,
    /// PII is redacted from responses; credentials are a violation
    RedactPii,
    /// Any PII or credential in a response is a violation
    #[default]
    NoPii,
}

impl fmt::Display for ContextPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextPolicy::Open => f.write_str("open"),
            ContextPolicy::RedactPii => f.write_str("redact_pii"),
            ContextPolicy::NoPii => f.write_str("no_pii"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Render".parse::<TaskType>().unwrap(), TaskType::Render);
        assert_eq!("LOW".parse::<PiiLevel>().unwrap(), PiiLevel::Low);
        assert_eq!(" standard ".parse::<BudgetTier>().unwrap(), BudgetTier::Standard);
    }

    #[test]
    fn test_parse_unknown_value() {
        let err = "gold".parse::<BudgetTier>().unwrap_err();
        assert_eq!(err.value, "gold");
        assert!(err.to_string().contains("budget tier"));
    }

    #[test]
    fn test_pii_ordering() {
        assert!(PiiLevel::None < PiiLevel::Low);
        assert!(PiiLevel::Moderate < PiiLevel::High);
    }

    #[test]
    fn test_tier_downgrade_chain() {
        assert_eq!(BudgetTier::Premium.downgrade(), Some(BudgetTier::Standard));
        assert_eq!(BudgetTier::Standard.downgrade(), Some(BudgetTier::Economy));
        assert_eq!(BudgetTier::Economy.downgrade(), None);
    }

    #[test]
    fn test_serde_snake_case() {
        let policy: ContextPolicy = serde_json::from_str("\"redact_pii\"").unwrap();
        assert_eq!(policy, ContextPolicy::RedactPii);
        assert_eq!(serde_json::to_string(&TaskType::Evidence).unwrap(), "\"evidence\"");
    }
}
