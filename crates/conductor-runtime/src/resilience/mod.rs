//! Resilience patterns for conductor-runtime.
//!
//! - Per-tier circuit breakers
//! - Cost and latency admission ([`CostGuard`])
//! - Retry backoff

mod backoff;
mod budget;
mod circuit_breaker;

pub use backoff::BackoffPolicy;
pub use budget::{Admission, AdmissionTicket, AdmitRequest, CostGuard, DenyReason, Ledger};
pub use circuit_breaker::{BreakerState, CallOutcome, CircuitBreaker, Permit};
