//! # conductor-core
//!
//! Deterministic building blocks of the Conductor workflow orchestrator.
//!
//! This crate answers, without any I/O beyond reading documents:
//! - Which provider route should this task attempt use?
//! - Is this task graph well formed, and what can run next?
//! - Does this artifact meet its rubric?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: routing and scoring are pure functions of their inputs
//! 2. **Immutable policy**: a [`PolicySnapshot`] never changes once built
//! 3. **Explicit state machines**: task and job states only move along legal edges
//! 4. **No async**: everything here is synchronous; the runtime crate drives it
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor_core::{PolicyDocument, PolicySnapshot, RequestContext};
//!
//! let snapshot = PolicySnapshot::new(PolicyDocument::from_file("policy.yaml".as_ref())?);
//! let decision = snapshot.decide(&ctx)?;
//! println!("{} via {:?}", decision.rule_id, decision.provider_order);
//! ```

pub mod audit;
pub mod evaluator;
pub mod evidence;
pub mod graph;
pub mod job;
pub mod patterns;
pub mod policy;
pub mod types;

// Re-export main types at crate root
pub use audit::{DecisionKind, DecisionRecord};
pub use evaluator::{
    Check, Criterion, CriterionScore, EvaluationResult, Evaluator, Rubric, RubricError,
    RubricEvaluator,
};
pub use evidence::{Artifact, EvidenceItem, EvidenceStrength, StrengthMix};
pub use graph::{GraphError, TaskGraph, TaskSpec};
pub use job::{FailureKind, Job, JobState, Task, TaskFailure, TaskState, TransitionError};
pub use patterns::Finding;
pub use policy::{
    PolicyDocument, PolicyError, PolicyRule, PolicySnapshot, RequestContext, RouteChoice,
    RouteDecision, RuleMatch, SpendSnapshot,
};
pub use types::{BudgetTier, ContextPolicy, JobId, ParseEnumError, PiiLevel, TaskId, TaskType};
