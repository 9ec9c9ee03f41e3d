//! # conductor-runtime
//!
//! Async execution for Conductor: everything that waits, spends money or
//! talks to the outside world.
//!
//! - [`WorkflowRunner`] drives jobs through their task graphs
//! - [`CostGuard`] admits provider calls against job and tier budgets and
//!   trips per-tier circuit breakers
//! - [`TaskExecutor`] runs a single attempt along a route's provider order
//! - [`DecisionLog`] keeps the audit trail and feeds the persistence buffer
//!
//! The deterministic pieces (policy evaluation, graph validation, scoring)
//! live in `conductor-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor_runtime::{Command, WorkflowRunner};
//!
//! let runner = WorkflowRunner::builder()
//!     .policy(PolicyDocument::from_file("policy.yaml".as_ref())?)
//!     .provider("local", Arc::new(my_adapter))
//!     .build()?;
//!
//! let (submission, handle) = runner.submit(Command::new(graph, BudgetTier::Standard, PiiLevel::Low))?;
//! let report = handle.wait().await?;
//! println!("{} finished {}", submission.job_id, report.state);
//! ```

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod decision_log;
pub mod executor;
pub mod orchestrator;
pub mod persistence;
pub mod policy_store;
pub mod providers;
pub mod resilience;
pub mod router;
pub mod telemetry;

pub use cache::EvaluationCache;
pub use config::{ConfigError, RuntimeConfig};
pub use decision_log::{DecisionLog, JobTrail};
pub use executor::{ExecutionContext, ExecutionReport, Outcome, TaskExecutor};
pub use orchestrator::{
    reachable_tier, Command, JobHandle, JobReport, Submission, WorkflowRunner,
    WorkflowRunnerBuilder,
};
pub use persistence::{BufferedWriter, MemorySink, PersistenceError, PersistenceSink, WriteOp};
pub use policy_store::PolicyStore;
pub use providers::{
    InvokeRequest, ProviderAdapter, ProviderError, ProviderRegistry, ProviderResponse,
};
pub use resilience::{Admission, AdmitRequest, BreakerState, CostGuard, DenyReason, Ledger};
pub use router::PolicyRouter;
pub use telemetry::{Metrics, MetricsSnapshot};

use conductor_core::{GraphError, PolicyError, TransitionError};

/// Errors surfaced to callers of the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid task graph: {0}")]
    Graph(#[from] GraphError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("job '{0}' is already running")]
    DuplicateJob(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("job aborted: {0}")]
    JobAborted(String),
}
