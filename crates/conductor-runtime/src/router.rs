//! Policy routing with an audit trail.

use std::sync::Arc;

use conductor_core::{DecisionKind, PolicyError, RequestContext, RouteDecision};

use crate::decision_log::DecisionLog;
use crate::policy_store::PolicyStore;
use crate::telemetry::Metrics;

/// Chooses a route per task attempt from the current policy snapshot.
///
/// Every call appends exactly one record: `Routed` with the chosen route, or
/// `RouteRejected` with the reason.
pub struct PolicyRouter {
    store: Arc<PolicyStore>,
    log: Arc<DecisionLog>,
    metrics: Arc<Metrics>,
}

impl PolicyRouter {
    pub fn new(store: Arc<PolicyStore>, log: Arc<DecisionLog>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            log,
            metrics,
        }
    }

    pub fn route(&self, ctx: &RequestContext) -> Result<RouteDecision, PolicyError> {
        let snapshot = self.store.snapshot();

        match snapshot.decide(ctx) {
            Ok(decision) => {
                self.metrics.route_decided();
                tracing::debug!(
                    job_id = %ctx.job_id,
                    task_id = %ctx.task_id,
                    attempt = ctx.attempt,
                    rule_id = %decision.rule_id,
                    model = %decision.model,
                    tier = %decision.budget_tier,
                    "Route chosen"
                );
                self.log.record(
                    &ctx.job_id,
                    &ctx.task_id,
                    ctx.attempt,
                    DecisionKind::Routed,
                    format!(
                        "rule '{}' of policy {}",
                        decision.rule_id, decision.snapshot_version
                    ),
                    Some(decision.clone()),
                );
                Ok(decision)
            }
            Err(e) => {
                self.metrics.route_rejected();
                tracing::info!(
                    job_id = %ctx.job_id,
                    task_id = %ctx.task_id,
                    attempt = ctx.attempt,
                    error = %e,
                    "No route"
                );
                self.log.record(
                    &ctx.job_id,
                    &ctx.task_id,
                    ctx.attempt,
                    DecisionKind::RouteRejected,
                    e.to_string(),
                    None,
                );
                Err(e)
            }
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::{
        BudgetTier, PiiLevel, PolicyDocument, SpendSnapshot, TaskType,
    };
    use std::collections::BTreeSet;

    const POLICY: &str = r#"
version: "3"
rules:
  - id: gen
    match: { task: generate, pii: { max: low } }
    choose: { provider_order: [a, b], model: m, max_cost_usd: 0.5, latency_p95_ms: 1000 }
"#;

    fn router() -> (PolicyRouter, Arc<DecisionLog>) {
        let store = Arc::new(PolicyStore::new(PolicyDocument::from_yaml(POLICY).unwrap()));
        let log = Arc::new(DecisionLog::new());
        (
            PolicyRouter::new(store, log.clone(), Arc::new(Metrics::new())),
            log,
        )
    }

    fn ctx(task_type: TaskType, pii: PiiLevel) -> RequestContext {
        RequestContext {
            job_id: "j".into(),
            task_id: "t".into(),
            attempt: 1,
            task_type,
            pii_level: pii,
            budget_tier: BudgetTier::Standard,
            spend: SpendSnapshot {
                cap_usd: Some(0.3),
                ..Default::default()
            },
            excluded_rules: BTreeSet::new(),
        }
    }

    #[test]
    fn test_route_records_decision() {
        let (router, log) = router();
        let decision = router.route(&ctx(TaskType::Generate, PiiLevel::None)).unwrap();
        assert_eq!(decision.rule_id, "gen");
        assert!((decision.max_cost_usd - 0.3).abs() < 1e-9);

        let records = log.records_for("j");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, DecisionKind::Routed);
        assert_eq!(records[0].chosen_route.as_ref(), Some(&decision));
    }

    #[test]
    fn test_rejection_records_reason() {
        let (router, log) = router();
        let err = router.route(&ctx(TaskType::Generate, PiiLevel::High)).unwrap_err();
        assert!(matches!(err, PolicyError::NoPolicyMatch { .. }));

        let records = log.records_for("j");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, DecisionKind::RouteRejected);
        assert!(records[0].chosen_route.is_none());
    }
}
