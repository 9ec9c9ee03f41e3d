//! Immutable policy snapshots and pure rule evaluation.
//!
//! `decide` takes no locks and reads no clocks: identical (snapshot, context)
//! pairs always produce identical decisions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::parser::{PolicyDocument, PolicyRule};
use super::PolicyError;
use crate::types::{BudgetTier, ContextPolicy, PiiLevel, TaskType};

/// Spend figures for the job, as seen when the route is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendSnapshot {
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub spent_latency_ms: u64,

    /// Job cap, if the tier has one
    pub cap_usd: Option<f64>,
}

impl SpendSnapshot {
    /// Budget still available to new reservations, if capped.
    pub fn remaining_usd(&self) -> Option<f64> {
        self.cap_usd
            .map(|cap| (cap - self.spent_usd - self.reserved_usd).max(0.0))
    }
}

/// Everything a routing decision depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub job_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub task_type: TaskType,
    pub pii_level: PiiLevel,
    pub budget_tier: BudgetTier,
    pub spend: SpendSnapshot,

    /// Rules this task already failed on (budget or quality)
    #[serde(default)]
    pub excluded_rules: BTreeSet<String>,
}

/// The route chosen for one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub rule_id: String,
    pub snapshot_version: String,
    pub provider_order: Vec<String>,
    pub model: String,

    /// Rule ceiling clamped to the job's remaining budget
    pub max_cost_usd: f64,
    pub latency_p95_ms: u64,
    pub context_policy: ContextPolicy,

    /// Tier the decision was made for
    pub budget_tier: BudgetTier,
}

/// A loaded policy. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    version: String,
    rules: Vec<PolicyRule>,
}

impl PolicySnapshot {
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            version: document.version,
            rules: document.rules,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// First rule, in declaration order, that matches and is not excluded.
    pub fn first_match(
        &self,
        task_type: TaskType,
        pii_level: PiiLevel,
        tier: BudgetTier,
        excluded: &BTreeSet<String>,
    ) -> Option<&PolicyRule> {
        self.rules
            .iter()
            .filter(|rule| !excluded.contains(&rule.id))
            .find(|rule| rule.when.matches(task_type, pii_level, tier))
    }

    /// Choose a route for the request.
    pub fn decide(&self, ctx: &RequestContext) -> Result<RouteDecision, PolicyError> {
        let rule = self
            .first_match(ctx.task_type, ctx.pii_level, ctx.budget_tier, &ctx.excluded_rules)
            .ok_or(PolicyError::NoPolicyMatch {
                task_type: ctx.task_type,
                pii_level: ctx.pii_level,
                tier: ctx.budget_tier,
            })?;

        let max_cost_usd = match ctx.spend.remaining_usd() {
            Some(remaining) => rule.choose.max_cost_usd.min(remaining),
            None => rule.choose.max_cost_usd,
        };

        Ok(RouteDecision {
            rule_id: rule.id.clone(),
            snapshot_version: self.version.clone(),
            provider_order: rule.choose.provider_order.clone(),
            model: rule.choose.model.clone(),
            max_cost_usd,
            latency_p95_ms: rule.choose.latency_p95_ms,
            context_policy: rule.choose.context_policy,
            budget_tier: ctx.budget_tier,
        })
    }
}
