//! Subcommand implementations. Each renders to a string so tests can check
//! the output without capturing stdout.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use conductor_core::{
    BudgetTier, PiiLevel, PolicyDocument, PolicySnapshot, RequestContext, SpendSnapshot,
    TaskGraph, TaskType,
};
use conductor_runtime::{reachable_tier, RuntimeConfig};

pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config
        .with_env_overrides()
        .context("applying CONDUCTOR_* overrides")
}

fn load_policy(path: &Path) -> Result<PolicySnapshot> {
    let document = PolicyDocument::from_file(path)
        .with_context(|| format!("loading policy {}", path.display()))?;
    Ok(PolicySnapshot::new(document))
}

pub fn validate_policy(path: &Path, config: &RuntimeConfig) -> Result<()> {
    print!("{}", policy_report(path, config)?);
    Ok(())
}

fn policy_report(path: &Path, config: &RuntimeConfig) -> Result<String> {
    let snapshot = load_policy(path)?;
    Ok(describe_policy(&snapshot, config))
}

/// Rule listing plus the request shapes no rule can serve.
pub fn describe_policy(snapshot: &PolicySnapshot, config: &RuntimeConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "policy {} is valid ({} rules)",
        snapshot.version(),
        snapshot.rules().len()
    );
    for rule in snapshot.rules() {
        let _ = writeln!(
            out,
            "  {:<24} {} via [{}] max ${:.4} p95 {}ms {}",
            rule.id,
            rule.choose.model,
            rule.choose.provider_order.join(", "),
            rule.choose.max_cost_usd,
            rule.choose.latency_p95_ms,
            rule.choose.context_policy,
        );
    }

    let none = BTreeSet::new();
    let mut gaps = Vec::new();
    for task in TaskType::ALL {
        for pii in PiiLevel::ALL {
            for tier in BudgetTier::ALL {
                if reachable_tier(snapshot, &config.tiers, task, pii, tier, &none).is_none() {
                    gaps.push(format!("{}/{}/{}", task, pii, tier));
                }
            }
        }
    }
    if !gaps.is_empty() {
        tracing::warn!(unroutable = gaps.len(), "Policy leaves requests without a route");
        let _ = writeln!(out, "unroutable (task/pii/tier): {}", gaps.join(", "));
    }
    out
}

pub fn route(
    policy: &Path,
    config: &RuntimeConfig,
    task: TaskType,
    pii: PiiLevel,
    tier: BudgetTier,
    excluded: Vec<String>,
) -> Result<()> {
    let snapshot = load_policy(policy)?;
    let excluded: BTreeSet<String> = excluded.into_iter().collect();
    let decision = decide(&snapshot, config, task, pii, tier, &excluded)?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

/// Route a fresh request, stepping down tiers the way a running job would.
fn decide(
    snapshot: &PolicySnapshot,
    config: &RuntimeConfig,
    task: TaskType,
    pii: PiiLevel,
    tier: BudgetTier,
    excluded: &BTreeSet<String>,
) -> Result<conductor_core::RouteDecision> {
    let effective = reachable_tier(snapshot, &config.tiers, task, pii, tier, excluded)
        .unwrap_or(tier);
    if effective != tier {
        tracing::info!(from = %tier, to = %effective, "Request served by a lower tier");
    }

    let ctx = RequestContext {
        job_id: "dry-run".to_string(),
        task_id: task.to_string(),
        attempt: 1,
        task_type: task,
        pii_level: pii,
        budget_tier: effective,
        spend: SpendSnapshot {
            cap_usd: config.tiers.get(tier).job_cap_usd,
            ..SpendSnapshot::default()
        },
        excluded_rules: excluded.clone(),
    };
    snapshot
        .decide(&ctx)
        .with_context(|| format!("routing {} at {} tier", task, tier))
}

pub fn plan(
    graph: &Path,
    policy: &Path,
    config: &RuntimeConfig,
    pii: PiiLevel,
    tier: BudgetTier,
) -> Result<()> {
    let graph = TaskGraph::from_file(graph)
        .with_context(|| format!("loading task graph {}", graph.display()))?;
    let snapshot = load_policy(policy)?;
    print!("{}", render_plan(&graph, &snapshot, config, pii, tier)?);
    Ok(())
}

/// Execution waves of `graph`, each task with the route its first attempt gets.
pub fn render_plan(
    graph: &TaskGraph,
    snapshot: &PolicySnapshot,
    config: &RuntimeConfig,
    pii: PiiLevel,
    tier: BudgetTier,
) -> Result<String> {
    let none = BTreeSet::new();
    let mut out = String::new();
    for (i, wave) in graph.waves()?.into_iter().enumerate() {
        let _ = writeln!(out, "wave {}:", i + 1);
        for spec in wave {
            let required = if config.completion.is_required(spec) {
                "required"
            } else {
                "optional"
            };
            match decide(snapshot, config, spec.task_type, pii, tier, &none) {
                Ok(decision) => {
                    let _ = writeln!(
                        out,
                        "  {} ({}, {}) -> {} [{}] {} @ {}",
                        spec.id,
                        spec.task_type,
                        required,
                        decision.rule_id,
                        decision.provider_order.join(", "),
                        decision.model,
                        decision.budget_tier,
                    );
                }
                Err(e) => {
                    let _ = writeln!(
                        out,
                        "  {} ({}, {}) -> NO ROUTE: {:#}",
                        spec.id, spec.task_type, required, e
                    );
                }
            }
        }
    }
    Ok(out)
}

pub fn check_config(config: &RuntimeConfig) -> Result<()> {
    config.validate()?;
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}
