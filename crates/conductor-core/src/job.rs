//! Job and task state machines.
//!
//! A job owns its tasks in an arena keyed by task id; tasks refer back to
//! the job by id only. Every task state change goes through
//! [`Task::transition`], which rejects moves the machine does not allow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::graph::{GraphError, TaskGraph, TaskSpec};
use crate::policy::RouteDecision;
use crate::types::{BudgetTier, JobId, PiiLevel, TaskId, TaskType};

/// Task lifecycle.
///
/// ```text
/// Queued -> Routed -> Executing -> Succeeded
///    |         |          |
///    |         +----------+-----> Retrying -> Queued (attempt + 1)
///    +---------+----------+-----> FailedFatal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Routed,
    Executing,
    Succeeded,
    Retrying,
    FailedFatal,
}

impl TaskState {
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Routed)
                | (Queued, FailedFatal)
                | (Routed, Executing)
                | (Routed, Retrying)
                | (Routed, FailedFatal)
                | (Executing, Succeeded)
                | (Executing, Retrying)
                | (Executing, FailedFatal)
                | (Retrying, Queued)
                | (Retrying, FailedFatal)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::FailedFatal)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Routed => "routed",
            TaskState::Executing => "executing",
            TaskState::Succeeded => "succeeded",
            TaskState::Retrying => "retrying",
            TaskState::FailedFatal => "failed_fatal",
        };
        f.write_str(s)
    }
}

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::PartiallyCompleted
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::PartiallyCompleted => "partially_completed",
        };
        f.write_str(s)
    }
}

/// Why a task attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimited,
    Network,
    BudgetExceeded,
    BreakerOpen,
    QualityBelowThreshold,
    PolicyViolation,
    SchemaValidation,
    ProviderRejected,
    NoRoute,
    Cancelled,
    AttemptsExhausted,
    DependencyFailed,
    Persistence,
}

impl FailureKind {
    /// Whether another attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::RateLimited
                | FailureKind::Network
                | FailureKind::BudgetExceeded
                | FailureKind::BreakerOpen
                | FailureKind::QualityBelowThreshold
        )
    }

    /// Failures that exclude the current rule and re-route.
    pub fn triggers_reroute(&self) -> bool {
        matches!(
            self,
            FailureKind::BudgetExceeded | FailureKind::QualityBelowThreshold
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Network => "network",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::BreakerOpen => "breaker_open",
            FailureKind::QualityBelowThreshold => "quality_below_threshold",
            FailureKind::PolicyViolation => "policy_violation",
            FailureKind::SchemaValidation => "schema_validation",
            FailureKind::ProviderRejected => "provider_rejected",
            FailureKind::NoRoute => "no_route",
            FailureKind::Cancelled => "cancelled",
            FailureKind::AttemptsExhausted => "attempts_exhausted",
            FailureKind::DependencyFailed => "dependency_failed",
            FailureKind::Persistence => "persistence",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded task failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub attempt: u32,
}

/// Illegal state change.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("task '{task_id}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

/// Runtime record of one task in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub task_type: TaskType,
    pub state: TaskState,

    /// Current attempt, starting at 1
    pub attempt: u32,

    /// Route of the current attempt
    pub route: Option<RouteDecision>,

    /// Accumulated across attempts
    pub cost_actual_usd: f64,
    pub latency_actual_ms: u64,

    /// Last failure, kept after a successful retry for diagnosis
    pub failure: Option<TaskFailure>,

    /// Rules this task failed on for budget or quality reasons
    pub excluded_rules: BTreeSet<String>,

    /// Tier used for routing; starts at the job tier and may only go down
    pub effective_tier: BudgetTier,

    /// Accepted response content
    pub output: Option<String>,
}

impl Task {
    pub fn new(spec: &TaskSpec, job_id: &str, tier: BudgetTier) -> Self {
        Self {
            id: spec.id.clone(),
            job_id: job_id.to_string(),
            task_type: spec.task_type,
            state: TaskState::Queued,
            attempt: 1,
            route: None,
            cost_actual_usd: 0.0,
            latency_actual_ms: 0,
            failure: None,
            excluded_rules: BTreeSet::new(),
            effective_tier: tier,
            output: None,
        }
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: TaskState) -> Result<TaskState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// `Retrying -> Queued` with the attempt counter advanced.
    pub fn requeue(&mut self) -> Result<TaskState, TransitionError> {
        let previous = self.transition(TaskState::Queued)?;
        self.attempt += 1;
        self.route = None;
        Ok(previous)
    }

    /// Move to `FailedFatal` with the given failure attached.
    pub fn fail(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Result<TaskState, TransitionError> {
        let previous = self.transition(TaskState::FailedFatal)?;
        self.failure = Some(TaskFailure {
            kind,
            message: message.into(),
            attempt: self.attempt,
        });
        Ok(previous)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A submitted workflow and its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub correlation_id: String,
    pub state: JobState,
    pub graph: TaskGraph,
    pub tier: BudgetTier,
    pub pii_level: PiiLevel,
    pub created_at: DateTime<Utc>,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl Job {
    /// Create a pending job; the graph is validated here and frozen after.
    pub fn new(
        id: impl Into<JobId>,
        correlation_id: impl Into<String>,
        graph: TaskGraph,
        tier: BudgetTier,
        pii_level: PiiLevel,
    ) -> Result<Self, GraphError> {
        graph.validate()?;
        let id = id.into();

        let tasks = graph
            .tasks
            .iter()
            .map(|spec| (spec.id.clone(), Task::new(spec, &id, tier)))
            .collect();

        Ok(Self {
            id,
            correlation_id: correlation_id.into(),
            state: JobState::Pending,
            graph,
            tier,
            pii_level,
            created_at: Utc::now(),
            tasks,
        })
    }

    pub fn start(&mut self) {
        if self.state == JobState::Pending {
            self.state = JobState::Running;
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn spec(&self, id: &str) -> Option<&TaskSpec> {
        self.graph.get(id)
    }

    /// Queued tasks whose dependencies have all succeeded, in graph order.
    pub fn runnable(&self) -> Vec<TaskId> {
        self.graph
            .tasks
            .iter()
            .filter(|spec| {
                self.tasks
                    .get(&spec.id)
                    .is_some_and(|t| t.state == TaskState::Queued)
            })
            .filter(|spec| {
                spec.depends_on.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .is_some_and(|t| t.state == TaskState::Succeeded)
                })
            })
            .map(|spec| spec.id.clone())
            .collect()
    }

    /// Fail every queued task that transitively depends on `failed`.
    ///
    /// Returns the ids that were blocked, in graph order.
    pub fn block_dependents(&mut self, failed: &str) -> Vec<TaskId> {
        let mut doomed: BTreeSet<TaskId> = BTreeSet::new();
        let mut frontier = vec![failed.to_string()];

        while let Some(current) = frontier.pop() {
            for spec in &self.graph.tasks {
                if spec.depends_on.iter().any(|d| *d == current) && doomed.insert(spec.id.clone()) {
                    frontier.push(spec.id.clone());
                }
            }
        }

        let mut blocked = Vec::new();
        for spec in &self.graph.tasks {
            if !doomed.contains(&spec.id) {
                continue;
            }
            if let Some(task) = self.tasks.get_mut(&spec.id) {
                if task.state == TaskState::Queued
                    && task
                        .fail(
                            FailureKind::DependencyFailed,
                            format!("dependency '{}' failed", failed),
                        )
                        .is_ok()
                {
                    blocked.push(spec.id.clone());
                }
            }
        }
        blocked
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(Task::is_terminal)
    }

    /// Terminal job state implied by task states.
    ///
    /// `is_required` is the completion policy: a failed or blocked task that
    /// is not required does not fail the job. Cancellation always fails it.
    pub fn settle<F>(&self, is_required: F) -> JobState
    where
        F: Fn(&TaskSpec) -> bool,
    {
        if !self.all_terminal() {
            return JobState::Running;
        }

        let unsuccessful: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state != TaskState::Succeeded)
            .collect();

        if unsuccessful.is_empty() {
            return JobState::Completed;
        }

        let cancelled = unsuccessful
            .iter()
            .any(|t| matches!(&t.failure, Some(f) if f.kind == FailureKind::Cancelled));
        let all_optional = unsuccessful
            .iter()
            .all(|t| self.spec(&t.id).is_some_and(|spec| !is_required(spec)));

        if !cancelled && all_optional {
            JobState::PartiallyCompleted
        } else {
            JobState::Failed
        }
    }
}
