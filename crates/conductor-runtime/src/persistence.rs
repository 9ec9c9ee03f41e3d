//! Durable storage for jobs, tasks, decisions and evaluations.
//!
//! Writes go through a bounded [`BufferedWriter`]: callers never await the
//! sink, a background task drains the buffer and retries transient sink
//! failures with exponential backoff. A full buffer is reported to the
//! caller instead of blocking.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use conductor_core::{DecisionRecord, EvaluationResult, Job, JobId, Task};

use crate::config::PersistenceConfig;
use crate::telemetry::Metrics;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    #[error("persistence buffer full ({capacity} pending writes)")]
    BufferFull { capacity: usize },

    #[error("persistence writer closed")]
    Closed,
}

impl PersistenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_))
    }
}

/// Storage backend.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<(), PersistenceError>;

    async fn save_task(&self, task: &Task) -> Result<(), PersistenceError>;

    async fn append_decision(&self, record: &DecisionRecord) -> Result<(), PersistenceError>;

    async fn append_evaluation(
        &self,
        job_id: &str,
        result: &EvaluationResult,
    ) -> Result<(), PersistenceError>;
}

/// One pending write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Job(Box<Job>),
    Task(Box<Task>),
    Decision(Box<DecisionRecord>),
    Evaluation {
        job_id: JobId,
        result: Box<EvaluationResult>,
    },
}

impl WriteOp {
    pub fn job_id(&self) -> &str {
        match self {
            WriteOp::Job(job) => &job.id,
            WriteOp::Task(task) => &task.job_id,
            WriteOp::Decision(record) => &record.job_id,
            WriteOp::Evaluation { job_id, .. } => job_id,
        }
    }

    async fn apply(&self, sink: &dyn PersistenceSink) -> Result<(), PersistenceError> {
        match self {
            WriteOp::Job(job) => sink.save_job(job).await,
            WriteOp::Task(task) => sink.save_task(task).await,
            WriteOp::Decision(record) => sink.append_decision(record).await,
            WriteOp::Evaluation { job_id, result } => sink.append_evaluation(job_id, result).await,
        }
    }
}

enum Message {
    Write(WriteOp),
    Flush(oneshot::Sender<()>),
}

/// Bounded, non-blocking front for a [`PersistenceSink`].
pub struct BufferedWriter {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    degraded: Arc<AtomicBool>,
    failed_jobs: Arc<Mutex<HashSet<JobId>>>,
}

impl BufferedWriter {
    /// Start the drain task. Must be called inside a tokio runtime.
    pub fn spawn(
        sink: Arc<dyn PersistenceSink>,
        config: &PersistenceConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(config.buffer_capacity.max(1));
        let degraded = Arc::new(AtomicBool::new(false));
        let failed_jobs: Arc<Mutex<HashSet<JobId>>> = Arc::new(Mutex::new(HashSet::new()));

        let backoff = ExponentialBuilder::default()
            .with_min_delay(config.retry_base)
            .with_max_delay(config.retry_base.saturating_mul(32).max(Duration::from_millis(1)))
            .with_max_times(config.retry_attempts);

        let handle = {
            let degraded = degraded.clone();
            let failed_jobs = failed_jobs.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let op = match message {
                        Message::Write(op) => op,
                        Message::Flush(done) => {
                            let _ = done.send(());
                            continue;
                        }
                    };

                    let result = (|| {
                        let sink = sink.clone();
                        let op = op.clone();
                        async move { op.apply(sink.as_ref()).await }
                    })
                    .retry(backoff.clone())
                    .sleep(tokio::time::sleep)
                    .when(PersistenceError::is_transient)
                    .notify(|err: &PersistenceError, delay: Duration| {
                        tracing::warn!(error = %err, ?delay, "Persistence write failed, retrying");
                    })
                    .await;

                    if let Err(e) = result {
                        degraded.store(true, Ordering::SeqCst);
                        failed_jobs.lock().insert(op.job_id().to_string());
                        metrics.persistence_dropped();
                        tracing::error!(job_id = %op.job_id(), error = %e, "Persistence write dropped");
                    }
                }
            })
        };

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            capacity: config.buffer_capacity,
            degraded,
            failed_jobs,
        }
    }

    /// Queue a write without waiting.
    pub fn try_write(&self, op: WriteOp) -> Result<(), PersistenceError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(PersistenceError::Closed)?;
        tx.try_send(Message::Write(op)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PersistenceError::BufferFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => PersistenceError::Closed,
        })
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let tx = self.tx.lock().clone().ok_or(PersistenceError::Closed)?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Message::Flush(done_tx))
            .await
            .map_err(|_| PersistenceError::Closed)?;
        done_rx.await.map_err(|_| PersistenceError::Closed)
    }

    /// True once any write has been dropped after exhausting retries.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Whether a write belonging to `job_id` was dropped.
    pub fn job_failed(&self, job_id: &str) -> bool {
        self.failed_jobs.lock().contains(job_id)
    }

    /// Drop the failure mark of a finished job, returning whether it was set.
    pub fn forget_job(&self, job_id: &str) -> bool {
        self.failed_jobs.lock().remove(job_id)
    }

    /// Stop accepting writes and wait for the buffer to drain.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// In-memory sink, useful for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    jobs: Mutex<Vec<Job>>,
    tasks: Mutex<Vec<Task>>,
    decisions: Mutex<Vec<DecisionRecord>>,
    evaluations: Mutex<Vec<(JobId, EvaluationResult)>>,
    fail_next: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every write until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().clone()
    }

    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.decisions.lock().clone()
    }

    pub fn evaluations(&self) -> Vec<(JobId, EvaluationResult)> {
        self.evaluations.lock().clone()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("sink offline".into()));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_next
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(PersistenceError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn save_job(&self, job: &Job) -> Result<(), PersistenceError> {
        self.check()?;
        self.jobs.lock().push(job.clone());
        Ok(())
    }

    async fn save_task(&self, task: &Task) -> Result<(), PersistenceError> {
        self.check()?;
        self.tasks.lock().push(task.clone());
        Ok(())
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<(), PersistenceError> {
        self.check()?;
        self.decisions.lock().push(record.clone());
        Ok(())
    }

    async fn append_evaluation(
        &self,
        job_id: &str,
        result: &EvaluationResult,
    ) -> Result<(), PersistenceError> {
        self.check()?;
        self.evaluations
            .lock()
            .push((job_id.to_string(), result.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::DecisionKind;

    fn record(job: &str, seq: u64) -> WriteOp {
        let mut record =
            DecisionRecord::for_task("corr", job, "t1", 1, DecisionKind::Routed, "test");
        record.seq = seq;
        WriteOp::Decision(Box::new(record))
    }

    fn config(capacity: usize) -> PersistenceConfig {
        PersistenceConfig {
            buffer_capacity: capacity,
            retry_attempts: 3,
            retry_base: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_writes_reach_sink_in_order() {
        let sink = Arc::new(MemorySink::new());
        let writer = BufferedWriter::spawn(sink.clone(), &config(16), Arc::new(Metrics::new()));
        for seq in 0..5 {
            writer.try_write(record("j", seq)).unwrap();
        }
        writer.flush().await.unwrap();

        let seqs: Vec<u64> = sink.decisions().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(!writer.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(2);
        let writer = BufferedWriter::spawn(sink.clone(), &config(16), Arc::new(Metrics::new()));
        writer.try_write(record("j", 0)).unwrap();
        writer.flush().await.unwrap();

        assert_eq!(sink.decisions().len(), 1);
        assert!(!writer.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_mark_job_failed() {
        let sink = Arc::new(MemorySink::new());
        sink.set_unavailable(true);
        let metrics = Arc::new(Metrics::new());
        let writer = BufferedWriter::spawn(sink.clone(), &config(16), metrics.clone());
        writer.try_write(record("j", 0)).unwrap();
        writer.flush().await.unwrap();

        assert!(writer.is_degraded());
        assert!(writer.job_failed("j"));
        assert!(!writer.job_failed("other"));
        assert_eq!(metrics.snapshot().persistence_dropped, 1);

        assert!(writer.forget_job("j"));
        assert!(!writer.job_failed("j"));
        assert!(!writer.forget_job("j"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_is_reported() {
        let sink = Arc::new(MemorySink::new());
        sink.set_unavailable(true);
        let writer = BufferedWriter::spawn(sink, &config(1), Arc::new(Metrics::new()));

        let mut full = false;
        for seq in 0..4 {
            if let Err(e) = writer.try_write(record("j", seq)) {
                assert_eq!(e, PersistenceError::BufferFull { capacity: 1 });
                full = true;
                break;
            }
        }
        assert!(full);
    }

    #[tokio::test]
    async fn test_closed_writer_rejects() {
        let writer = BufferedWriter::spawn(
            Arc::new(MemorySink::new()),
            &config(4),
            Arc::new(Metrics::new()),
        );
        writer.shutdown().await;
        assert_eq!(writer.try_write(record("j", 0)), Err(PersistenceError::Closed));
    }
}
