//! Routing policy documents from YAML/JSON.
//!
//! Loading runs three passes: syntax (serde_yaml / serde_json), structure
//! (JSON Schema), then semantics (non-empty matches, positive ceilings,
//! unique ids, no duplicated rules). Any failure rejects the whole document.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

use super::schema::validate_policy_schema;
use super::PolicyError;
use crate::types::{BudgetTier, ContextPolicy, PiiLevel, TaskType};

/// A match field holding one value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: PartialEq> Selector<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Selector::One(v) => v == value,
            Selector::Many(values) => values.contains(value),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Selector::Many(values) if values.is_empty())
    }
}

/// PII selector: a level, a list of levels, or `{max: level}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PiiSelector {
    One(PiiLevel),
    Many(Vec<PiiLevel>),
    AtMost { max: PiiLevel },
}

impl PiiSelector {
    pub fn matches(&self, level: PiiLevel) -> bool {
        match self {
            PiiSelector::One(v) => *v == level,
            PiiSelector::Many(values) => values.contains(&level),
            PiiSelector::AtMost { max } => level <= *max,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, PiiSelector::Many(values) if values.is_empty())
    }
}

/// Conditions a request must satisfy. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Selector<TaskType>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pii: Option<PiiSelector>,

    #[serde(default, alias = "budgetTier", skip_serializing_if = "Option::is_none")]
    pub budget_tier: Option<Selector<BudgetTier>>,
}

/// Every (task, pii, tier) combination a match accepts.
type Coverage = BTreeSet<(TaskType, PiiLevel, BudgetTier)>;

impl RuleMatch {
    pub fn is_empty(&self) -> bool {
        self.task.is_none() && self.pii.is_none() && self.budget_tier.is_none()
    }

    pub fn matches(&self, task: TaskType, pii: PiiLevel, tier: BudgetTier) -> bool {
        self.task.as_ref().map_or(true, |s| s.matches(&task))
            && self.pii.as_ref().map_or(true, |s| s.matches(pii))
            && self.budget_tier.as_ref().map_or(true, |s| s.matches(&tier))
    }

    fn coverage(&self) -> Coverage {
        let mut out = BTreeSet::new();
        for task in TaskType::ALL {
            for pii in PiiLevel::ALL {
                for tier in BudgetTier::ALL {
                    if self.matches(task, pii, tier) {
                        out.insert((task, pii, tier));
                    }
                }
            }
        }
        out
    }
}

/// The route a matching rule selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteChoice {
    /// Providers to try, in order
    #[serde(alias = "providerOrder")]
    pub provider_order: Vec<String>,

    pub model: String,

    /// Per-call cost ceiling
    #[serde(alias = "maxCostUsd")]
    pub max_cost_usd: f64,

    /// Per-call latency ceiling, also the hard invocation timeout
    #[serde(alias = "latencyP95Ms")]
    pub latency_p95_ms: u64,

    #[serde(default, alias = "contextPolicy")]
    pub context_policy: ContextPolicy,
}

/// A single routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule identifier; defaults to `rule-<n>` (1-based position)
    #[serde(default)]
    pub id: String,

    #[serde(rename = "match")]
    pub when: RuleMatch,

    pub choose: RouteChoice,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Wrapped {
        #[serde(default)]
        version: Option<serde_json::Value>,
        rules: Vec<PolicyRule>,
    },
    Bare(Vec<PolicyRule>),
}

/// A parsed and validated routing policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDocument {
    /// Declared version, or a content digest when the document has none
    pub version: String,

    /// Rules in declaration order
    pub rules: Vec<PolicyRule>,
}

impl PolicyDocument {
    /// Parse a policy document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a policy document from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Load a policy document from a file, choosing the format by extension.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let content = fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Validate and type an already-parsed document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, PolicyError> {
        validate_policy_schema(&value).map_err(PolicyError::Schema)?;

        let digest = content_digest(&value);
        let (version, mut rules) = match serde_json::from_value::<RawDocument>(value)? {
            RawDocument::Wrapped { version, rules } => (version.map(version_string), rules),
            RawDocument::Bare(rules) => (None, rules),
        };

        for (index, rule) in rules.iter_mut().enumerate() {
            if rule.id.trim().is_empty() {
                rule.id = format!("rule-{}", index + 1);
            }
        }

        let document = Self {
            version: version.unwrap_or_else(|| format!("sha-{:016x}", digest)),
            rules,
        };
        document.validate()?;

        tracing::debug!(
            version = %document.version,
            rules = document.rules.len(),
            "Loaded routing policy"
        );

        Ok(document)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.rules.is_empty() {
            return Err(PolicyError::Malformed("policy has no rules".to_string()));
        }

        let mut seen_ids = HashSet::new();
        let mut earlier: Vec<(&PolicyRule, Coverage)> = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            if !seen_ids.insert(rule.id.as_str()) {
                return Err(PolicyError::Ambiguous {
                    rule_id: rule.id.clone(),
                    reason: "duplicate rule id".to_string(),
                });
            }

            check_rule(rule)?;

            let coverage = rule.when.coverage();
            if let Some((prior, _)) = earlier
                .iter()
                .find(|(prior, cov)| *cov == coverage && prior.choose == rule.choose)
            {
                return Err(PolicyError::Ambiguous {
                    rule_id: rule.id.clone(),
                    reason: format!("duplicates rule '{}'", prior.id),
                });
            }
            earlier.push((rule, coverage));
        }

        Ok(())
    }
}

fn check_rule(rule: &PolicyRule) -> Result<(), PolicyError> {
    let malformed = |what: &str| PolicyError::Malformed(format!("rule '{}': {}", rule.id, what));

    if rule.when.is_empty() {
        return Err(malformed("match must name at least one of task, pii, budget_tier"));
    }
    if rule.when.task.as_ref().is_some_and(Selector::is_empty)
        || rule.when.pii.as_ref().is_some_and(PiiSelector::is_empty)
        || rule.when.budget_tier.as_ref().is_some_and(Selector::is_empty)
    {
        return Err(malformed("match lists must not be empty"));
    }
    if rule.choose.provider_order.is_empty() {
        return Err(malformed("provider_order must not be empty"));
    }
    if rule.choose.model.trim().is_empty() {
        return Err(malformed("model must not be empty"));
    }
    if !rule.choose.max_cost_usd.is_finite() || rule.choose.max_cost_usd <= 0.0 {
        return Err(malformed("max_cost_usd must be positive"));
    }
    if rule.choose.latency_p95_ms == 0 {
        return Err(malformed("latency_p95_ms must be positive"));
    }

    Ok(())
}

fn version_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn content_digest(value: &serde_json::Value) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    hasher.finish()
}
