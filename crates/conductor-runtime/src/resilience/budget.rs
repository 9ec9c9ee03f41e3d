//! Cost and latency admission control.
//!
//! [`CostGuard`] keeps one ledger per job and one per budget tier. Every
//! provider call must hold an [`AdmissionTicket`]: admission checks the caps
//! and reserves the projected cost in a single critical section, so
//! concurrent callers can never jointly overshoot a cap.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use conductor_core::{BudgetTier, JobId, SpendSnapshot};

use super::circuit_breaker::{BreakerState, CallOutcome, CircuitBreaker, Permit};
use crate::config::{BreakerConfig, TiersConfig};
use crate::telemetry::Metrics;

const EPSILON: f64 = 1e-9;

/// Money and latency accounted against a job or a tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub spent_usd: f64,
    pub reserved_usd: f64,
    pub spent_latency_ms: u64,
}

impl Ledger {
    fn committed(&self) -> f64 {
        self.spent_usd + self.reserved_usd
    }
}

/// One admission request for a provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmitRequest {
    pub job_id: JobId,
    /// Tier the call is charged to (the task's effective tier)
    pub tier: BudgetTier,
    pub projected_cost_usd: f64,
    pub projected_latency_ms: u64,
    /// Ceilings from the chosen route
    pub route_max_cost_usd: f64,
    pub route_latency_p95_ms: u64,
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Projected cost exceeds the route's ceiling
    RouteCeiling,
    /// Projected latency exceeds the route's p95 or the job's latency budget
    LatencyCeiling,
    /// The job cap cannot fit this call even with nothing reserved
    JobCap,
    /// The tier cap cannot fit this call even with nothing reserved
    TierCap,
    /// The tier's circuit is open
    BreakerOpen,
    /// Outstanding reservations currently leave no room
    Reserved,
    /// The job has no open ledger
    UnknownJob,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RouteCeiling => "route_ceiling",
            DenyReason::LatencyCeiling => "latency_ceiling",
            DenyReason::JobCap => "job_cap",
            DenyReason::TierCap => "tier_cap",
            DenyReason::BreakerOpen => "breaker_open",
            DenyReason::Reserved => "reserved",
            DenyReason::UnknownJob => "unknown_job",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of admission. Settled with [`CostGuard::record`] or
/// [`CostGuard::release`]; a ticket dropped unsettled (its call was aborted)
/// is charged what it reserved and gives back its breaker permit.
#[derive(Debug)]
pub struct AdmissionTicket {
    id: u64,
    pub job_id: JobId,
    pub tier: BudgetTier,
    pub reserved_usd: f64,
    permit: Permit,
    guard: Weak<GuardInner>,
    settled: bool,
}

impl AdmissionTicket {
    pub fn is_probe(&self) -> bool {
        self.permit == Permit::Probe
    }
}

impl PartialEq for AdmissionTicket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.job_id == other.job_id
            && self.tier == other.tier
            && self.permit == other.permit
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(inner) = self.guard.upgrade() {
            tracing::debug!(
                job_id = %self.job_id,
                tier = %self.tier,
                reserved_usd = self.reserved_usd,
                "Admission ticket dropped unsettled"
            );
            inner.abandon(self);
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Admission {
    Admitted(AdmissionTicket),
    Denied(DenyReason),
}

#[derive(Debug)]
struct JobLedger {
    /// Tier the job was submitted at; its cap governs the job
    tier: BudgetTier,
    ledger: Ledger,
}

#[derive(Debug)]
struct Outstanding {
    job_id: JobId,
    tier: BudgetTier,
    reserved_usd: f64,
}

#[derive(Debug, Default)]
struct GuardState {
    jobs: HashMap<JobId, JobLedger>,
    tiers: HashMap<BudgetTier, Ledger>,
    outstanding: HashMap<u64, Outstanding>,
    next_ticket: u64,
}

/// Admission control for provider calls.
pub struct CostGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    state: Mutex<GuardState>,
    breaker: CircuitBreaker,
    tiers: TiersConfig,
    metrics: Arc<Metrics>,
    settled: Notify,
}

impl CostGuard {
    pub fn new(tiers: TiersConfig, breaker: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                state: Mutex::new(GuardState::default()),
                breaker: CircuitBreaker::new(breaker, metrics.clone()),
                tiers,
                metrics,
                settled: Notify::new(),
            }),
        }
    }

    /// Start accounting for a job submitted at `tier`.
    pub fn open_job(&self, job_id: &str, tier: BudgetTier) {
        self.inner
            .state
            .lock()
            .jobs
            .entry(job_id.to_string())
            .or_insert(JobLedger {
                tier,
                ledger: Ledger::default(),
            });
    }

    /// Check every ceiling and reserve the projected cost, atomically.
    pub fn admit(&self, req: &AdmitRequest) -> Admission {
        let admission = self.try_admit(req);
        self.inner
            .metrics
            .admission(matches!(admission, Admission::Admitted(_)));
        if let Admission::Denied(reason) = &admission {
            tracing::debug!(
                job_id = %req.job_id,
                tier = %req.tier,
                projected_cost_usd = req.projected_cost_usd,
                reason = %reason,
                "Admission denied"
            );
        }
        admission
    }

    /// Like [`admit`](Self::admit), but while the only obstacle is other
    /// callers' reservations, wait up to `wait` for them to settle.
    pub async fn admit_within(&self, req: &AdmitRequest, wait: Duration) -> Admission {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.admit(req) {
                Admission::Denied(DenyReason::Reserved) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Admission::Denied(DenyReason::Reserved);
                    }
                }
                other => return other,
            }
        }
    }

    fn try_admit(&self, req: &AdmitRequest) -> Admission {
        use Admission::Denied;

        let inner = &self.inner;
        let mut state = inner.state.lock();
        let Some(job) = state.jobs.get(&req.job_id) else {
            return Denied(DenyReason::UnknownJob);
        };
        let job_tier = job.tier;
        let job_ledger = job.ledger;
        let projected = req.projected_cost_usd.max(0.0);

        if projected > req.route_max_cost_usd + EPSILON {
            return Denied(DenyReason::RouteCeiling);
        }

        if req.projected_latency_ms > req.route_latency_p95_ms {
            return Denied(DenyReason::LatencyCeiling);
        }
        if let Some(budget) = inner.tiers.get(job_tier).job_latency_budget {
            let budget_ms = budget.as_millis() as u64;
            if job_ledger.spent_latency_ms + req.projected_latency_ms > budget_ms {
                return Denied(DenyReason::LatencyCeiling);
            }
        }

        if let Some(cap) = inner.tiers.get(job_tier).job_cap_usd {
            if job_ledger.spent_usd + projected > cap + EPSILON {
                return Denied(DenyReason::JobCap);
            }
            if job_ledger.committed() + projected > cap + EPSILON {
                return Denied(DenyReason::Reserved);
            }
        }

        let tier_ledger = state.tiers.get(&req.tier).copied().unwrap_or_default();
        if let Some(cap) = inner.tiers.get(req.tier).tier_cap_usd {
            if tier_ledger.spent_usd + projected > cap + EPSILON {
                return Denied(DenyReason::TierCap);
            }
            if tier_ledger.committed() + projected > cap + EPSILON {
                return Denied(DenyReason::Reserved);
            }
        }

        let Some(permit) = inner.breaker.try_acquire(req.tier) else {
            return Denied(DenyReason::BreakerOpen);
        };

        let id = state.next_ticket;
        state.next_ticket += 1;
        if let Some(job) = state.jobs.get_mut(&req.job_id) {
            job.ledger.reserved_usd += projected;
        }
        state.tiers.entry(req.tier).or_default().reserved_usd += projected;
        state.outstanding.insert(
            id,
            Outstanding {
                job_id: req.job_id.clone(),
                tier: req.tier,
                reserved_usd: projected,
            },
        );

        Admission::Admitted(AdmissionTicket {
            id,
            job_id: req.job_id.clone(),
            tier: req.tier,
            reserved_usd: projected,
            permit,
            guard: Arc::downgrade(inner),
            settled: false,
        })
    }

    /// Settle a ticket with the call's actual spend.
    ///
    /// A successful call that spent more than it reserved counts as an
    /// overrun for the tier's breaker.
    pub fn record(
        &self,
        mut ticket: AdmissionTicket,
        cost_usd: f64,
        latency_ms: u64,
        succeeded: bool,
    ) -> CallOutcome {
        ticket.settled = true;
        let cost_usd = cost_usd.max(0.0);
        let outcome = if !succeeded {
            CallOutcome::Failure
        } else if cost_usd > ticket.reserved_usd + EPSILON {
            CallOutcome::Overrun
        } else {
            CallOutcome::Success
        };

        {
            let mut state = self.inner.state.lock();
            state.charge(&ticket, cost_usd, latency_ms);
            self.inner.breaker.record(ticket.tier, ticket.permit, outcome);
        }

        if outcome == CallOutcome::Overrun {
            tracing::warn!(
                job_id = %ticket.job_id,
                tier = %ticket.tier,
                reserved_usd = ticket.reserved_usd,
                cost_usd,
                "Call spent more than it reserved"
            );
        }
        self.inner.metrics.spend(cost_usd, latency_ms);
        self.inner.settled.notify_waiters();
        outcome
    }

    /// Give back a ticket whose call never ran.
    pub fn release(&self, mut ticket: AdmissionTicket) {
        ticket.settled = true;
        {
            let mut state = self.inner.state.lock();
            if let Some(o) = state.outstanding.remove(&ticket.id) {
                if let Some(job) = state.jobs.get_mut(&o.job_id) {
                    job.ledger.reserved_usd = (job.ledger.reserved_usd - o.reserved_usd).max(0.0);
                }
                let tier = state.tiers.entry(o.tier).or_default();
                tier.reserved_usd = (tier.reserved_usd - o.reserved_usd).max(0.0);
            }
            self.inner.breaker.release(ticket.tier, ticket.permit);
        }
        self.inner.settled.notify_waiters();
    }

    /// Stop accounting for a job, dropping any reservation it still holds.
    pub fn close_job(&self, job_id: &str) -> Option<Ledger> {
        let mut state = self.inner.state.lock();
        let job = state.jobs.remove(job_id)?;

        let stale: Vec<u64> = state
            .outstanding
            .iter()
            .filter(|(_, o)| o.job_id == job_id)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(o) = state.outstanding.remove(&id) {
                let tier = state.tiers.entry(o.tier).or_default();
                tier.reserved_usd = (tier.reserved_usd - o.reserved_usd).max(0.0);
            }
        }
        drop(state);

        self.inner.settled.notify_waiters();
        Some(job.ledger)
    }

    /// Spend view handed to the router.
    pub fn spend_snapshot(&self, job_id: &str) -> Option<SpendSnapshot> {
        let state = self.inner.state.lock();
        let job = state.jobs.get(job_id)?;
        Some(SpendSnapshot {
            spent_usd: job.ledger.spent_usd,
            reserved_usd: job.ledger.reserved_usd,
            spent_latency_ms: job.ledger.spent_latency_ms,
            cap_usd: self.inner.tiers.get(job.tier).job_cap_usd,
        })
    }

    pub fn job_ledger(&self, job_id: &str) -> Option<Ledger> {
        self.inner.state.lock().jobs.get(job_id).map(|j| j.ledger)
    }

    pub fn tier_ledger(&self, tier: BudgetTier) -> Ledger {
        self.inner.state.lock().tiers.get(&tier).copied().unwrap_or_default()
    }

    pub fn breaker_state(&self, tier: BudgetTier) -> BreakerState {
        self.inner.breaker.state(tier)
    }
}

impl GuardInner {
    /// Settle a ticket whose call was aborted mid-flight. The actual cost is
    /// unknown, so the reservation is charged, as for a timed-out call. The
    /// breaker gets its permit back without an outcome.
    fn abandon(&self, ticket: &AdmissionTicket) {
        {
            let mut state = self.state.lock();
            let charged = state
                .outstanding
                .get(&ticket.id)
                .map(|o| o.reserved_usd)
                .unwrap_or(0.0);
            state.charge(ticket, charged, 0);
            self.breaker.release(ticket.tier, ticket.permit);
        }
        self.settled.notify_waiters();
    }
}

impl GuardState {
    /// Move a ticket's reservation into spend on its job and tier ledgers.
    fn charge(&mut self, ticket: &AdmissionTicket, cost_usd: f64, latency_ms: u64) {
        let reserved = self
            .outstanding
            .remove(&ticket.id)
            .map(|o| o.reserved_usd)
            .unwrap_or(0.0);

        if let Some(job) = self.jobs.get_mut(&ticket.job_id) {
            job.ledger.reserved_usd = (job.ledger.reserved_usd - reserved).max(0.0);
            job.ledger.spent_usd += cost_usd;
            job.ledger.spent_latency_ms += latency_ms;
        }
        let tier = self.tiers.entry(ticket.tier).or_default();
        tier.reserved_usd = (tier.reserved_usd - reserved).max(0.0);
        tier.spent_usd += cost_usd;
        tier.spent_latency_ms += latency_ms;
    }
}
