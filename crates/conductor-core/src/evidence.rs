//! Artifacts and the evidence attached to them.
//!
//! Every artifact a task produces carries the evidence its provider cited.
//! Rubric criteria score that evidence; nothing here is ever inferred.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

/// How strongly a piece of evidence supports its claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    Weak,
    Medium,
    Strong,
}

/// A single piece of evidence supporting an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Evidence kind (e.g., "interview", "analytics", "experiment", "desk")
    pub kind: String,

    /// Strength of the signal
    pub strength: EvidenceStrength,

    /// Quality score in [0, 1]
    pub quality: f64,

    /// Where the evidence came from (URL, document id, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EvidenceItem {
    pub fn new(kind: impl Into<String>, strength: EvidenceStrength, quality: f64) -> Self {
        Self {
            kind: kind.into(),
            strength,
            quality,
            source: None,
        }
    }

    /// Attach a source pointer.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Counts of evidence per strength.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrengthMix {
    #[serde(default)]
    pub weak: usize,
    #[serde(default)]
    pub medium: usize,
    #[serde(default)]
    pub strong: usize,
}

/// Output of one task attempt, as handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: String,

    /// Attempt that produced this artifact (1-based)
    pub attempt: u32,

    /// Primary content (markdown, JSON, ...)
    pub content: String,

    /// Evidence cited by the producer
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,

    /// Model that produced the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Artifact {
    pub fn new(task_id: impl Into<String>, attempt: u32, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt,
            content: content.into(),
            evidence: Vec::new(),
            model: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<EvidenceItem>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Mean evidence quality; 0.0 when there is no evidence.
    pub fn mean_quality(&self) -> f64 {
        if self.evidence.is_empty() {
            return 0.0;
        }
        let total: f64 = self.evidence.iter().map(|e| e.quality).sum();
        total / self.evidence.len() as f64
    }

    /// Number of evidence items of the given kind.
    pub fn count_of_kind(&self, kind: &str) -> usize {
        self.evidence.iter().filter(|e| e.kind == kind).count()
    }

    /// Distinct evidence kinds present.
    pub fn kinds(&self) -> BTreeSet<&str> {
        self.evidence.iter().map(|e| e.kind.as_str()).collect()
    }

    /// Evidence counts by strength.
    pub fn strength_mix(&self) -> StrengthMix {
        let mut mix = StrengthMix::default();
        for item in &self.evidence {
            match item.strength {
                EvidenceStrength::Weak => mix.weak += 1,
                EvidenceStrength::Medium => mix.medium += 1,
                EvidenceStrength::Strong => mix.strong += 1,
            }
        }
        mix
    }

    /// Number of distinct kinds backed by at least one medium-or-stronger item.
    pub fn converging_signals(&self) -> usize {
        let mut by_kind: BTreeMap<&str, EvidenceStrength> = BTreeMap::new();
        for item in &self.evidence {
            let entry = by_kind.entry(item.kind.as_str()).or_insert(item.strength);
            if item.strength > *entry {
                *entry = item.strength;
            }
        }
        by_kind
            .values()
            .filter(|s| **s >= EvidenceStrength::Medium)
            .count()
    }

    /// Stable digest of content and evidence, ignoring task id and attempt.
    pub fn digest(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        self.content.hash(&mut hasher);
        for item in &self.evidence {
            item.kind.hash(&mut hasher);
            item.strength.hash(&mut hasher);
            item.quality.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Artifact {
        Artifact::new("t1", 1, "body").with_evidence(vec![
            EvidenceItem::new("interview", EvidenceStrength::Strong, 0.9),
            EvidenceItem::new("analytics", EvidenceStrength::Medium, 0.8),
            EvidenceItem::new("experiment", EvidenceStrength::Strong, 0.85),
            EvidenceItem::new("experiment", EvidenceStrength::Medium, 0.75),
            EvidenceItem::new("desk", EvidenceStrength::Weak, 0.6),
        ])
    }

    #[test]
    fn test_mean_quality() {
        let expected = (0.9 + 0.8 + 0.85 + 0.75 + 0.6) / 5.0;
        assert!((sample().mean_quality() - expected).abs() < 1e-9);
        assert_eq!(Artifact::new("t", 1, "").mean_quality(), 0.0);
    }

    #[test]
    fn test_counts_and_kinds() {
        let artifact = sample();
        assert_eq!(artifact.count_of_kind("experiment"), 2);
        assert_eq!(artifact.count_of_kind("survey"), 0);
        assert_eq!(artifact.kinds().len(), 4);
        assert_eq!(
            artifact.strength_mix(),
            StrengthMix {
                weak: 1,
                medium: 2,
                strong: 2
            }
        );
    }

    #[test]
    fn test_converging_signals_ignore_weak_kinds() {
        // desk is only weak, so three kinds converge
        assert_eq!(sample().converging_signals(), 3);
    }

    #[test]
    fn test_digest_ignores_attempt() {
        let mut a = sample();
        let b = sample();
        a.attempt = 2;
        assert_eq!(a.digest(), b.digest());
        a.content.push('!');
        assert_ne!(a.digest(), b.digest());
    }
}
