//! Decision records: the append-only audit trail of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{FailureKind, TaskState};
use crate::policy::RouteDecision;

/// What kind of decision a record captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionKind {
    /// A route was chosen
    Routed,

    /// No route could be chosen
    RouteRejected,

    /// CostGuard admission outcome for one provider
    Admission { provider: String, admitted: bool },

    /// A provider call finished
    Executed {
        provider: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureKind>,
        cost_usd: f64,
        latency_ms: u64,
    },

    /// An artifact was scored
    Evaluated { passed: bool, value: f64 },

    /// A task changed state
    Transition { from: TaskState, to: TaskState },
}

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Position in the log, assigned on append
    pub seq: u64,
    pub correlation_id: String,
    pub job_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub attempt: u32,

    #[serde(flatten)]
    pub kind: DecisionKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_route: Option<RouteDecision>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    /// A record for a task attempt; `seq` is assigned by the log.
    pub fn for_task(
        correlation_id: &str,
        job_id: &str,
        task_id: &str,
        attempt: u32,
        kind: DecisionKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            correlation_id: correlation_id.to_string(),
            job_id: job_id.to_string(),
            task_id: Some(task_id.to_string()),
            attempt,
            kind,
            chosen_route: None,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_route(mut self, route: RouteDecision) -> Self {
        self.chosen_route = Some(route);
        self
    }

    pub fn is_transition_to(&self, state: TaskState) -> bool {
        matches!(self.kind, DecisionKind::Transition { to, .. } if to == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_flattened_into_record() {
        let record = DecisionRecord::for_task(
            "corr",
            "job",
            "t1",
            2,
            DecisionKind::Transition {
                from: TaskState::Executing,
                to: TaskState::Retrying,
            },
            "timeout",
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "transition");
        assert_eq!(json["to"], "retrying");
        assert_eq!(json["attempt"], 2);
        assert!(json.get("chosen_route").is_none());
        assert!(record.is_transition_to(TaskState::Retrying));
    }
}
