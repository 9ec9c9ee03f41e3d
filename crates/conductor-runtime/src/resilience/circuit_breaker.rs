//! Per-tier circuit breakers.
//!
//! When calls in a budget tier fail repeatedly, or fail/overrun too often
//! within the rolling window, the tier's circuit opens and admission is
//! denied until the cool-down elapses. Half-open circuits admit a bounded
//! number of probes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;

use conductor_core::BudgetTier;

use crate::config::BreakerConfig;
use crate::telemetry::Metrics;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// How an admitted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// The call succeeded but spent more than it reserved
    Overrun,
    Failure,
}

/// Admission granted by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

#[derive(Debug)]
struct TierCircuit {
    state: CircuitState,
    /// (when, bad) samples inside the rolling window
    samples: VecDeque<(Instant, bool)>,
}

impl Default for TierCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            samples: VecDeque::new(),
        }
    }
}

/// Circuit breakers keyed by budget tier.
///
/// Each tier has its own circuit so one degraded tier does not stall the
/// others.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<BudgetTier, TierCircuit>>,
    config: BreakerConfig,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
            metrics,
        }
    }

    /// Ask to admit a call in `tier`. `None` means the circuit refuses.
    pub fn try_acquire(&self, tier: BudgetTier) -> Option<Permit> {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(tier).or_default();
        self.refresh(tier, circuit);

        match &mut circuit.state {
            CircuitState::Closed { .. } => Some(Permit::Normal),
            CircuitState::Open { .. } => None,
            CircuitState::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.half_open_probes {
                    *in_flight += 1;
                    Some(Permit::Probe)
                } else {
                    None
                }
            }
        }
    }

    /// Report how an admitted call ended.
    pub fn record(&self, tier: BudgetTier, permit: Permit, outcome: CallOutcome) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(tier).or_default();
        let now = Instant::now();

        if let CircuitState::HalfOpen {
            in_flight,
            successes,
        } = &mut circuit.state
        {
            if permit != Permit::Probe {
                // Admitted before the circuit opened; says nothing about recovery
                return;
            }
            *in_flight = in_flight.saturating_sub(1);
            match outcome {
                CallOutcome::Failure => {
                    self.open(tier, circuit, now, "probe failed");
                }
                CallOutcome::Success | CallOutcome::Overrun => {
                    *successes += 1;
                    if *successes >= self.config.success_threshold {
                        circuit.state = CircuitState::Closed {
                            consecutive_failures: 0,
                        };
                        circuit.samples.clear();
                        self.metrics.breaker_transition();
                        tracing::info!(tier = %tier, "Circuit closed after successful probes");
                    }
                }
            }
            return;
        }

        circuit
            .samples
            .push_back((now, outcome != CallOutcome::Success));
        self.prune(circuit, now);

        let consecutive = match &mut circuit.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                match outcome {
                    CallOutcome::Failure => *consecutive_failures += 1,
                    CallOutcome::Success => *consecutive_failures = 0,
                    // Overruns only feed the rate window
                    CallOutcome::Overrun => {}
                }
                *consecutive_failures
            }
            // Late results from calls admitted before the circuit opened
            _ => return,
        };

        if consecutive >= self.config.failure_threshold {
            self.open(tier, circuit, now, "consecutive failures");
            return;
        }

        let total = circuit.samples.len() as u32;
        if total >= self.config.min_samples.max(1) {
            let bad = circuit.samples.iter().filter(|(_, bad)| *bad).count() as f64;
            let rate = bad / total as f64;
            if rate > self.config.failure_rate {
                self.open(tier, circuit, now, "failure rate");
            }
        }
    }

    /// Return a permit whose call never happened (e.g. cancelled).
    pub fn release(&self, tier: BudgetTier, permit: Permit) {
        if permit != Permit::Probe {
            return;
        }
        let mut circuits = self.circuits.lock();
        if let Some(TierCircuit {
            state: CircuitState::HalfOpen { in_flight, .. },
            ..
        }) = circuits.get_mut(&tier)
        {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    /// Current state, applying any pending cool-down expiry.
    pub fn state(&self, tier: BudgetTier) -> BreakerState {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(tier).or_default();
        self.refresh(tier, circuit);

        match circuit.state {
            CircuitState::Closed { .. } => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    fn refresh(&self, tier: BudgetTier, circuit: &mut TierCircuit) {
        if let CircuitState::Open { opened_at } = circuit.state {
            if opened_at.elapsed() >= self.config.cool_down {
                circuit.state = CircuitState::HalfOpen {
                    in_flight: 0,
                    successes: 0,
                };
                self.metrics.breaker_transition();
                tracing::info!(tier = %tier, "Circuit half-open, admitting probes");
            }
        }
    }

    fn prune(&self, circuit: &mut TierCircuit, now: Instant) {
        while let Some((at, _)) = circuit.samples.front() {
            if now.duration_since(*at) > self.config.window {
                circuit.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&self, tier: BudgetTier, circuit: &mut TierCircuit, now: Instant, reason: &str) {
        circuit.state = CircuitState::Open { opened_at: now };
        circuit.samples.clear();
        self.metrics.breaker_transition();
        tracing::warn!(tier = %tier, reason, "Circuit opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(config, Arc::new(Metrics::new()))
    }

    fn fail(cb: &CircuitBreaker, tier: BudgetTier) {
        let permit = cb.try_acquire(tier).unwrap();
        cb.record(tier, permit, CallOutcome::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        fail(&cb, BudgetTier::Standard);
        assert_eq!(cb.state(BudgetTier::Standard), BreakerState::Closed);
        fail(&cb, BudgetTier::Standard);
        assert_eq!(cb.state(BudgetTier::Standard), BreakerState::Open);
        assert!(cb.try_acquire(BudgetTier::Standard).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiers_are_independent() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        fail(&cb, BudgetTier::Economy);
        assert_eq!(cb.state(BudgetTier::Economy), BreakerState::Open);
        assert_eq!(cb.state(BudgetTier::Premium), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 3,
            min_samples: 100,
            ..Default::default()
        });
        let tier = BudgetTier::Standard;
        fail(&cb, tier);
        fail(&cb, tier);
        let permit = cb.try_acquire(tier).unwrap();
        cb.record(tier, permit, CallOutcome::Success);
        fail(&cb, tier);
        fail(&cb, tier);
        assert_eq!(cb.state(tier), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_counts_overruns() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 100,
            failure_rate: 0.5,
            min_samples: 4,
            ..Default::default()
        });
        let tier = BudgetTier::Economy;
        for outcome in [CallOutcome::Success, CallOutcome::Overrun, CallOutcome::Overrun] {
            let permit = cb.try_acquire(tier).unwrap();
            cb.record(tier, permit, outcome);
        }
        assert_eq!(cb.state(tier), BreakerState::Closed);
        let permit = cb.try_acquire(tier).unwrap();
        cb.record(tier, permit, CallOutcome::Failure);
        // 3 bad of 4 > 0.5
        assert_eq!(cb.state(tier), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_samples_leave_window() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 100,
            failure_rate: 0.5,
            min_samples: 3,
            window: Duration::from_secs(10),
            ..Default::default()
        });
        let tier = BudgetTier::Standard;
        fail(&cb, tier);
        fail(&cb, tier);
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..3 {
            let permit = cb.try_acquire(tier).unwrap();
            cb.record(tier, permit, CallOutcome::Success);
        }
        assert_eq!(cb.state(tier), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cool_down_then_probe_recovery() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_secs(5),
            half_open_probes: 1,
            success_threshold: 2,
            ..Default::default()
        });
        let tier = BudgetTier::Premium;
        fail(&cb, tier);
        assert_eq!(cb.state(tier), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cb.state(tier), BreakerState::HalfOpen);

        let probe = cb.try_acquire(tier).unwrap();
        assert_eq!(probe, Permit::Probe);
        // Only one probe at a time
        assert!(cb.try_acquire(tier).is_none());
        cb.record(tier, probe, CallOutcome::Success);
        assert_eq!(cb.state(tier), BreakerState::HalfOpen);

        let probe = cb.try_acquire(tier).unwrap();
        cb.record(tier, probe, CallOutcome::Success);
        assert_eq!(cb.state(tier), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_secs(1),
            ..Default::default()
        });
        let tier = BudgetTier::Standard;
        fail(&cb, tier);
        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = cb.try_acquire(tier).unwrap();
        cb.record(tier, probe, CallOutcome::Failure);
        assert_eq!(cb.state(tier), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_normal_result_does_not_move_half_open() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_secs(1),
            success_threshold: 1,
            ..Default::default()
        });
        let tier = BudgetTier::Standard;
        let slow = cb.try_acquire(tier).unwrap();
        assert_eq!(slow, Permit::Normal);
        fail(&cb, tier);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(tier), BreakerState::HalfOpen);

        cb.record(tier, slow, CallOutcome::Failure);
        assert_eq!(cb.state(tier), BreakerState::HalfOpen);
        cb.record(tier, Permit::Normal, CallOutcome::Success);
        assert_eq!(cb.state(tier), BreakerState::HalfOpen);

        let probe = cb.try_acquire(tier).unwrap();
        assert_eq!(probe, Permit::Probe);
        cb.record(tier, probe, CallOutcome::Success);
        assert_eq!(cb.state(tier), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_frees_slot() {
        let cb = breaker(BreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_secs(1),
            ..Default::default()
        });
        let tier = BudgetTier::Economy;
        fail(&cb, tier);
        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = cb.try_acquire(tier).unwrap();
        assert!(cb.try_acquire(tier).is_none());
        cb.release(tier, probe);
        assert!(cb.try_acquire(tier).is_some());
    }
}
