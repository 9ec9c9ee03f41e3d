//! Append-only audit trail.
//!
//! Sequence numbers are assigned under the log's lock and records are
//! handed to the persistence buffer in that same critical section, so the
//! sink sees them in sequence order.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use conductor_core::{DecisionKind, DecisionRecord, EvaluationResult, JobId, RouteDecision};

use crate::persistence::{BufferedWriter, WriteOp};

/// Everything the log holds for one job.
#[derive(Debug, Clone, Default)]
pub struct JobTrail {
    pub correlation_id: String,
    /// In sequence order
    pub records: Vec<DecisionRecord>,
    pub evaluations: Vec<EvaluationResult>,
    pub persistence_failed: bool,
}

#[derive(Default)]
struct LogState {
    next_seq: u64,
    jobs: HashMap<JobId, JobTrail>,
}

impl LogState {
    fn job(&mut self, job_id: &str) -> &mut JobTrail {
        self.jobs.entry(job_id.to_string()).or_default()
    }
}

/// Decision records and evaluations of running jobs, keyed by job id.
///
/// A job's trail stays here until [`take_job`](DecisionLog::take_job) hands
/// it to the job's report.
pub struct DecisionLog {
    state: Mutex<LogState>,
    writer: Option<Arc<BufferedWriter>>,
}

impl DecisionLog {
    /// A log that keeps records in memory only.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            writer: None,
        }
    }

    pub fn with_writer(writer: Arc<BufferedWriter>) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            writer: Some(writer),
        }
    }

    /// Remember the correlation id records of `job_id` are tagged with.
    pub fn register_job(&self, job_id: &str, correlation_id: &str) {
        self.state.lock().job(job_id).correlation_id = correlation_id.to_string();
    }

    pub fn correlation_id(&self, job_id: &str) -> Option<String> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .map(|trail| trail.correlation_id.clone())
    }

    /// Build and append a record for a task attempt.
    pub fn record(
        &self,
        job_id: &str,
        task_id: &str,
        attempt: u32,
        kind: DecisionKind,
        reason: impl Into<String>,
        route: Option<RouteDecision>,
    ) -> DecisionRecord {
        let correlation_id = self.correlation_id(job_id).unwrap_or_default();
        let mut record =
            DecisionRecord::for_task(&correlation_id, job_id, task_id, attempt, kind, reason);
        record.chosen_route = route;
        self.append(record)
    }

    /// Append a record, assigning its sequence number.
    pub fn append(&self, mut record: DecisionRecord) -> DecisionRecord {
        let mut state = self.state.lock();
        record.seq = state.next_seq;
        state.next_seq += 1;

        tracing::debug!(
            seq = record.seq,
            job_id = %record.job_id,
            task_id = record.task_id.as_deref().unwrap_or(""),
            attempt = record.attempt,
            reason = %record.reason,
            "Decision recorded"
        );

        let trail = state.job(&record.job_id);
        trail.records.push(record.clone());
        if let Some(writer) = &self.writer {
            if let Err(e) = writer.try_write(WriteOp::Decision(Box::new(record.clone()))) {
                tracing::error!(job_id = %record.job_id, seq = record.seq, error = %e, "Decision not persisted");
                trail.persistence_failed = true;
            }
        }
        record
    }

    pub fn append_evaluation(&self, job_id: &str, result: EvaluationResult) {
        let mut state = self.state.lock();
        let trail = state.job(job_id);
        trail.evaluations.push(result.clone());
        if let Some(writer) = &self.writer {
            let op = WriteOp::Evaluation {
                job_id: job_id.to_string(),
                result: Box::new(result),
            };
            if let Err(e) = writer.try_write(op) {
                tracing::error!(job_id = %job_id, error = %e, "Evaluation not persisted");
                trail.persistence_failed = true;
            }
        }
    }

    /// Queue a job or task snapshot for persistence.
    pub fn persist(&self, op: WriteOp) {
        let Some(writer) = &self.writer else {
            return;
        };
        let job_id = op.job_id().to_string();
        let mut state = self.state.lock();
        if let Err(e) = writer.try_write(op) {
            tracing::error!(job_id = %job_id, error = %e, "Snapshot not persisted");
            state.job(&job_id).persistence_failed = true;
        }
    }

    /// Records of `job_id`, in sequence order.
    pub fn records_for(&self, job_id: &str) -> Vec<DecisionRecord> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .map(|trail| trail.records.clone())
            .unwrap_or_default()
    }

    pub fn evaluations_for(&self, job_id: &str) -> Vec<EvaluationResult> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .map(|trail| trail.evaluations.clone())
            .unwrap_or_default()
    }

    /// Whether any write for `job_id` was refused or dropped.
    pub fn persistence_failed(&self, job_id: &str) -> bool {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .is_some_and(|trail| trail.persistence_failed)
            || self.writer.as_ref().is_some_and(|w| w.job_failed(job_id))
    }

    /// Remove and return everything held for a finished job.
    pub fn take_job(&self, job_id: &str) -> JobTrail {
        let mut trail = self.state.lock().jobs.remove(job_id).unwrap_or_default();
        if let Some(writer) = &self.writer {
            trail.persistence_failed |= writer.forget_job(job_id);
        }
        trail
    }

    /// Jobs the log currently holds a trail for.
    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn writer(&self) -> Option<&Arc<BufferedWriter>> {
        self.writer.as_ref()
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}
