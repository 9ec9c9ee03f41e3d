//! Counters and spans.
//!
//! Counters are plain atomics; exporting them is left to the embedding
//! service. Every task attempt runs inside [`task_attempt_span`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide runtime counters.
#[derive(Debug, Default)]
pub struct Metrics {
    route_decisions: AtomicU64,
    route_rejections: AtomicU64,
    admissions: AtomicU64,
    admission_denials: AtomicU64,
    cost_micro_usd: AtomicU64,
    latency_ms: AtomicU64,
    breaker_transitions: AtomicU64,
    retries: AtomicU64,
    evaluations: AtomicU64,
    evaluation_cache_hits: AtomicU64,
    persistence_dropped: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub route_decisions: u64,
    pub route_rejections: u64,
    pub admissions: u64,
    pub admission_denials: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub breaker_transitions: u64,
    pub retries: u64,
    pub evaluations: u64,
    pub evaluation_cache_hits: u64,
    pub persistence_dropped: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route_decided(&self) {
        self.route_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_rejected(&self) {
        self.route_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn admission(&self, admitted: bool) {
        if admitted {
            self.admissions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.admission_denials.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record provider spend and latency.
    pub fn spend(&self, cost_usd: f64, latency_ms: u64) {
        let micros = (cost_usd.max(0.0) * 1_000_000.0).round() as u64;
        self.cost_micro_usd.fetch_add(micros, Ordering::Relaxed);
        self.latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn breaker_transition(&self) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evaluation(&self, cache_hit: bool) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.evaluation_cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn persistence_dropped(&self) {
        self.persistence_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            route_decisions: self.route_decisions.load(Ordering::Relaxed),
            route_rejections: self.route_rejections.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            admission_denials: self.admission_denials.load(Ordering::Relaxed),
            cost_usd: self.cost_micro_usd.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            latency_ms: self.latency_ms.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            evaluation_cache_hits: self.evaluation_cache_hits.load(Ordering::Relaxed),
            persistence_dropped: self.persistence_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Span covering one task attempt.
pub fn task_attempt_span(
    job_id: &str,
    task_id: &str,
    attempt: u32,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "task_attempt",
        job_id = %job_id,
        task_id = %task_id,
        attempt,
        correlation_id = %correlation_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spend_is_tracked_in_micro_dollars() {
        let metrics = Metrics::new();
        metrics.spend(0.0125, 40);
        metrics.spend(0.0025, 10);
        let snap = metrics.snapshot();
        assert!((snap.cost_usd - 0.015).abs() < 1e-9);
        assert_eq!(snap.latency_ms, 50);
    }

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.route_decided();
        metrics.route_rejected();
        metrics.admission(true);
        metrics.admission(false);
        metrics.admission(false);
        metrics.evaluation(true);
        let snap = metrics.snapshot();
        assert_eq!(snap.route_decisions, 1);
        assert_eq!(snap.route_rejections, 1);
        assert_eq!(snap.admissions, 1);
        assert_eq!(snap.admission_denials, 2);
        assert_eq!(snap.evaluation_cache_hits, 1);
    }
}
