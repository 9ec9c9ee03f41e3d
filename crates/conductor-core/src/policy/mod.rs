//! Routing policy: document parsing, schema validation and snapshots.

mod parser;
mod schema;
mod snapshot;

pub use parser::{PiiSelector, PolicyDocument, PolicyRule, RouteChoice, RuleMatch, Selector};
pub use schema::validate_policy_schema;
pub use snapshot::{PolicySnapshot, RequestContext, RouteDecision, SpendSnapshot};

use thiserror::Error;

use crate::types::{BudgetTier, PiiLevel, TaskType};

/// Errors from loading or evaluating a routing policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("no policy rule matches task={task_type} pii={pii_level} tier={tier}")]
    NoPolicyMatch {
        task_type: TaskType,
        pii_level: PiiLevel,
        tier: BudgetTier,
    },

    #[error("malformed policy: {0}")]
    Malformed(String),

    #[error("policy failed schema validation: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("ambiguous policy rule '{rule_id}': {reason}")]
    Ambiguous { rule_id: String, reason: String },

    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}
