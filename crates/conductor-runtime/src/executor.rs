//! Single-attempt task execution.
//!
//! The executor walks a route's provider order. For each registered
//! provider it asks the [`CostGuard`] for admission, calls the provider
//! under the route's latency ceiling, applies the route's context policy
//! and the task's output schema. It never retries; the runner decides
//! what happens after a failed attempt.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use conductor_core::{
    patterns, BudgetTier, DecisionKind, FailureKind, PiiLevel, RouteDecision, TaskId, TaskSpec,
};

use crate::config::ExecutorConfig;
use crate::decision_log::DecisionLog;
use crate::providers::{InvokeRequest, ProviderRegistry, ProviderResponse};
use crate::resilience::{Admission, AdmitRequest, CostGuard, DenyReason};

/// Everything the executor needs to know about one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub correlation_id: String,
    pub attempt: u32,
    /// Tier the attempt is charged to
    pub tier: BudgetTier,
    pub pii_level: PiiLevel,
    pub spec: TaskSpec,
    /// Flips to `true` when the job is cancelled or stopped
    pub cancel: watch::Receiver<bool>,
    /// Told `(task, attempt)` when the first provider call is admitted
    pub on_admit: Option<mpsc::UnboundedSender<(TaskId, u32)>>,
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetriableFailure { kind: FailureKind },
    FatalFailure { kind: FailureKind },
}

impl Outcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success => None,
            Outcome::RetriableFailure { kind } | Outcome::FatalFailure { kind } => Some(*kind),
        }
    }
}

/// One provider considered during an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderAttempt {
    pub provider: String,
    pub denied: Option<DenyReason>,
    pub failure: Option<FailureKind>,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    /// Accepted response, after context-policy redaction
    pub response: Option<ProviderResponse>,
    pub cost_actual_usd: f64,
    pub latency_actual_ms: u64,
    pub provider_attempts: Vec<ProviderAttempt>,
    /// Whether any provider call was admitted
    pub admitted: bool,
    pub message: String,
}

impl ExecutionReport {
    fn new() -> Self {
        Self {
            outcome: Outcome::FatalFailure {
                kind: FailureKind::ProviderRejected,
            },
            response: None,
            cost_actual_usd: 0.0,
            latency_actual_ms: 0,
            provider_attempts: Vec::new(),
            admitted: false,
            message: String::new(),
        }
    }

    /// Report for an attempt cancelled before any provider was tried.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new().finish(
            Outcome::FatalFailure {
                kind: FailureKind::Cancelled,
            },
            message,
        )
    }

    fn finish(mut self, outcome: Outcome, message: impl Into<String>) -> Self {
        self.outcome = outcome;
        self.message = message.into();
        self
    }
}

pub struct TaskExecutor {
    registry: Arc<ProviderRegistry>,
    guard: Arc<CostGuard>,
    log: Arc<DecisionLog>,
    config: ExecutorConfig,
}

/// Resolves once the job is cancelled.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        // Sender gone without cancelling: never fires
        std::future::pending::<()>().await;
    }
}

/// Validate response content against a task's output schema.
pub fn check_output_schema(schema: &serde_json::Value, content: &str) -> Result<(), String> {
    let instance: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("response is not JSON: {}", e))?;
    let validator = jsonschema::options()
        .build(schema)
        .map_err(|e| format!("invalid output schema: {}", e))?;

    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        guard: Arc<CostGuard>,
        log: Arc<DecisionLog>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            log,
            config,
        }
    }

    /// Run one attempt of a task along `route`.
    pub async fn execute(&self, ctx: &ExecutionContext, route: &RouteDecision) -> ExecutionReport {
        let mut report = ExecutionReport::new();
        let mut cancel = ctx.cancel.clone();
        let task_id = ctx.spec.id.as_str();
        let timeout = Duration::from_millis(route.latency_p95_ms);

        let mut denial: Option<DenyReason> = None;
        let mut transient: Option<(FailureKind, String)> = None;
        let mut schema_failure: Option<String> = None;
        let mut any_registered = false;

        for provider in &route.provider_order {
            let Some(adapter) = self.registry.get(provider) else {
                tracing::debug!(provider = %provider, "Provider not registered, skipping");
                continue;
            };
            any_registered = true;

            let request = InvokeRequest {
                job_id: ctx.job_id.clone(),
                task_id: task_id.to_string(),
                attempt: ctx.attempt,
                task_type: ctx.spec.task_type,
                model: route.model.clone(),
                input: ctx.spec.input.clone(),
                max_cost_usd: route.max_cost_usd,
                timeout,
                context_policy: route.context_policy,
            };
            let estimate = adapter.estimate(&request);
            let projected_cost = estimate
                .cost_usd
                .max(ctx.spec.estimated_cost_usd.unwrap_or(0.0));

            let admit = AdmitRequest {
                job_id: ctx.job_id.clone(),
                tier: ctx.tier,
                projected_cost_usd: projected_cost,
                projected_latency_ms: estimate.latency_ms,
                route_max_cost_usd: route.max_cost_usd,
                route_latency_p95_ms: route.latency_p95_ms,
            };

            let admission = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    return report.finish(
                        Outcome::FatalFailure { kind: FailureKind::Cancelled },
                        "cancelled while waiting for admission",
                    );
                }
                admission = self.guard.admit_within(&admit, self.config.admission_wait) => admission,
            };

            let ticket = match admission {
                Admission::Admitted(ticket) => ticket,
                Admission::Denied(reason) => {
                    self.log.record(
                        &ctx.job_id,
                        task_id,
                        ctx.attempt,
                        DecisionKind::Admission {
                            provider: provider.clone(),
                            admitted: false,
                        },
                        format!("denied: {} (projected ${:.4})", reason, projected_cost),
                        None,
                    );
                    report.provider_attempts.push(ProviderAttempt {
                        provider: provider.clone(),
                        denied: Some(reason),
                        failure: None,
                        cost_usd: 0.0,
                        latency_ms: 0,
                    });
                    denial = Some(reason);
                    continue;
                }
            };

            self.log.record(
                &ctx.job_id,
                task_id,
                ctx.attempt,
                DecisionKind::Admission {
                    provider: provider.clone(),
                    admitted: true,
                },
                format!("reserved ${:.4}", ticket.reserved_usd),
                None,
            );
            if !report.admitted {
                report.admitted = true;
                if let Some(tx) = &ctx.on_admit {
                    let _ = tx.send((task_id.to_string(), ctx.attempt));
                }
            }

            let started = Instant::now();
            let call = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    self.guard.release(ticket);
                    return report.finish(
                        Outcome::FatalFailure { kind: FailureKind::Cancelled },
                        format!("cancelled during call to '{}'", provider),
                    );
                }
                call = tokio::time::timeout(timeout, adapter.invoke(&request)) => call,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match call {
                Err(_) => {
                    // Timed-out calls are charged what they reserved
                    let charged = ticket.reserved_usd;
                    self.guard.record(ticket, charged, route.latency_p95_ms, false);
                    report.cost_actual_usd += charged;
                    report.latency_actual_ms += route.latency_p95_ms;
                    self.log_executed(ctx, provider, Some(FailureKind::Timeout), charged, route.latency_p95_ms);
                    report.provider_attempts.push(ProviderAttempt {
                        provider: provider.clone(),
                        denied: None,
                        failure: Some(FailureKind::Timeout),
                        cost_usd: charged,
                        latency_ms: route.latency_p95_ms,
                    });
                    tracing::warn!(provider = %provider, ?timeout, "Provider call timed out");
                    return report.finish(
                        Outcome::RetriableFailure { kind: FailureKind::Timeout },
                        format!("'{}' exceeded {}ms", provider, route.latency_p95_ms),
                    );
                }
                Ok(Err(e)) => {
                    let kind = e.failure_kind();
                    self.guard.record(ticket, 0.0, elapsed_ms, false);
                    report.latency_actual_ms += elapsed_ms;
                    self.log_executed(ctx, provider, Some(kind), 0.0, elapsed_ms);
                    report.provider_attempts.push(ProviderAttempt {
                        provider: provider.clone(),
                        denied: None,
                        failure: Some(kind),
                        cost_usd: 0.0,
                        latency_ms: elapsed_ms,
                    });
                    tracing::warn!(provider = %provider, error = %e, "Provider call failed");

                    if !e.is_transient() {
                        return report.finish(
                            Outcome::FatalFailure { kind },
                            format!("'{}': {}", provider, e),
                        );
                    }
                    if !self.config.fallback_on_transient {
                        return report.finish(
                            Outcome::RetriableFailure { kind },
                            format!("'{}': {}", provider, e),
                        );
                    }
                    transient = Some((kind, format!("'{}': {}", provider, e)));
                }
                Ok(Ok(mut response)) => {
                    let cost = response.cost_usd.max(0.0);
                    let latency = response.latency_ms;
                    self.guard.record(ticket, cost, latency, true);
                    report.cost_actual_usd += cost;
                    report.latency_actual_ms += latency;
                    self.log_executed(ctx, provider, None, cost, latency);
                    report.provider_attempts.push(ProviderAttempt {
                        provider: provider.clone(),
                        denied: None,
                        failure: None,
                        cost_usd: cost,
                        latency_ms: latency,
                    });

                    match patterns::enforce(route.context_policy, &response.content) {
                        Ok(content) => response.content = content,
                        Err(findings) => {
                            tracing::warn!(provider = %provider, ?findings, "Response violates context policy");
                            return report.finish(
                                Outcome::FatalFailure { kind: FailureKind::PolicyViolation },
                                format!(
                                    "response from '{}' violates {}: {:?}",
                                    provider, route.context_policy, findings
                                ),
                            );
                        }
                    }

                    if let Some(schema) = &ctx.spec.output_schema {
                        if let Err(reason) = check_output_schema(schema, &response.content) {
                            tracing::info!(provider = %provider, reason = %reason, "Response failed output schema");
                            schema_failure = Some(format!("'{}': {}", provider, reason));
                            continue;
                        }
                    }

                    report.response = Some(response);
                    return report.finish(Outcome::Success, format!("served by '{}'", provider));
                }
            }
        }

        if let Some(reason) = schema_failure {
            return report.finish(
                Outcome::FatalFailure { kind: FailureKind::SchemaValidation },
                reason,
            );
        }
        if let Some((kind, message)) = transient {
            return report.finish(Outcome::RetriableFailure { kind }, message);
        }
        if let Some(reason) = denial {
            let kind = match reason {
                DenyReason::BreakerOpen => FailureKind::BreakerOpen,
                _ => FailureKind::BudgetExceeded,
            };
            return report.finish(
                Outcome::RetriableFailure { kind },
                format!("no provider admitted (last: {})", reason),
            );
        }
        if !any_registered {
            return report.finish(
                Outcome::FatalFailure { kind: FailureKind::ProviderRejected },
                format!("no registered provider in {:?}", route.provider_order),
            );
        }
        report.finish(
            Outcome::FatalFailure { kind: FailureKind::ProviderRejected },
            "provider order exhausted",
        )
    }

    fn log_executed(
        &self,
        ctx: &ExecutionContext,
        provider: &str,
        failure: Option<FailureKind>,
        cost_usd: f64,
        latency_ms: u64,
    ) {
        let reason = match failure {
            Some(kind) => format!("'{}' failed: {}", provider, kind),
            None => format!("'{}' responded", provider),
        };
        self.log.record(
            &ctx.job_id,
            &ctx.spec.id,
            ctx.attempt,
            DecisionKind::Executed {
                provider: provider.to_string(),
                success: failure.is_none(),
                failure,
                cost_usd,
                latency_ms,
            },
            reason,
            None,
        );
    }
}
