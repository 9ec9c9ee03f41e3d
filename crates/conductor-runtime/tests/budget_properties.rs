//! Budget invariants of the cost guard under arbitrary call sequences.

use std::sync::Arc;

use conductor_core::BudgetTier;
use conductor_runtime::config::{BreakerConfig, TiersConfig};
use conductor_runtime::{Admission, AdmitRequest, CostGuard, Metrics};
use proptest::prelude::*;

const JOB: &str = "job-prop";
const CAP: f64 = 1.0;
const EPSILON: f64 = 1e-9;

fn guard() -> CostGuard {
    let mut tiers = TiersConfig::default();
    tiers.standard.job_cap_usd = Some(CAP);
    tiers.standard.tier_cap_usd = None;
    let breaker = BreakerConfig {
        failure_threshold: u32::MAX,
        min_samples: u32::MAX,
        ..BreakerConfig::default()
    };
    let guard = CostGuard::new(tiers, breaker, Arc::new(Metrics::new()));
    guard.open_job(JOB, BudgetTier::Standard);
    guard
}

fn request(projected: f64) -> AdmitRequest {
    AdmitRequest {
        job_id: JOB.to_string(),
        tier: BudgetTier::Standard,
        projected_cost_usd: projected,
        projected_latency_ms: 10,
        route_max_cost_usd: 1.0,
        route_latency_p95_ms: 1000,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Calls that spend at most what they reserved never push a job over its cap,
    /// however admissions and settlements interleave.
    #[test]
    fn concurrent_spend_stays_within_cap(
        calls in prop::collection::vec((0.01f64..0.4, 0.0f64..=1.0, any::<bool>()), 1..40),
    ) {
        let guard = guard();
        let chunks: Vec<Vec<(f64, f64, bool)>> =
            calls.chunks(5).map(|c| c.to_vec()).collect();

        std::thread::scope(|scope| {
            for chunk in &chunks {
                let guard = &guard;
                scope.spawn(move || {
                    for &(projected, fraction, succeeded) in chunk {
                        if let Admission::Admitted(ticket) = guard.admit(&request(projected)) {
                            guard.record(ticket, projected * fraction, 10, succeeded);
                        }
                    }
                });
            }
        });

        let ledger = guard.job_ledger(JOB).unwrap();
        prop_assert!(ledger.spent_usd <= CAP + EPSILON, "spent {}", ledger.spent_usd);
        prop_assert!(ledger.reserved_usd.abs() < EPSILON);
    }

    /// Overruns can exceed the cap by at most one call's projection.
    #[test]
    fn overruns_are_bounded_by_one_projection(
        calls in prop::collection::vec((0.01f64..0.4, 0.0f64..=2.0), 1..40),
    ) {
        let guard = guard();
        let mut largest = 0.0f64;

        for (projected, factor) in calls {
            largest = largest.max(projected);
            match guard.admit(&request(projected)) {
                Admission::Admitted(ticket) => {
                    guard.record(ticket, projected * factor, 10, true);
                }
                Admission::Denied(_) => {}
            }
            let ledger = guard.job_ledger(JOB).unwrap();
            prop_assert!(
                ledger.spent_usd <= CAP + largest + EPSILON,
                "spent {} with largest projection {}",
                ledger.spent_usd,
                largest
            );
        }
    }

    /// Released reservations leave no trace in the ledger.
    #[test]
    fn released_tickets_leave_nothing_reserved(
        projections in prop::collection::vec(0.01f64..0.3, 1..20),
    ) {
        let guard = guard();
        let tickets: Vec<_> = projections
            .iter()
            .filter_map(|p| match guard.admit(&request(*p)) {
                Admission::Admitted(ticket) => Some(ticket),
                Admission::Denied(_) => None,
            })
            .collect();

        let reserved: f64 = tickets.iter().map(|t| t.reserved_usd).sum();
        prop_assert!(reserved <= CAP + EPSILON);

        for ticket in tickets {
            guard.release(ticket);
        }
        let ledger = guard.job_ledger(JOB).unwrap();
        prop_assert!(ledger.reserved_usd.abs() < EPSILON);
        prop_assert_eq!(ledger.spent_usd, 0.0);
    }
}
