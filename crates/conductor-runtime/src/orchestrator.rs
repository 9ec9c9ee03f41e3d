//! Workflow runner.
//!
//! Each submitted job gets its own driver task. The driver owns the job (and
//! with it every task's state machine), routes runnable tasks, hands
//! attempts to a bounded worker pool per tier and decides what happens
//! after every attempt: accept, retry with backoff, re-route, downgrade or
//! fail. Workers never touch job state; they report back over a `JoinSet`.
//!
//! ```text
//! submit ──► preflight ──► driver ──► dispatch ──► worker (execute + evaluate)
//!                            ▲                          │
//!                            └──── finished / backoff ◄─┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use conductor_core::{
    Artifact, BudgetTier, DecisionKind, DecisionRecord, EvaluationResult, Evaluator, FailureKind,
    Job, JobId, JobState, PiiLevel, PolicyDocument, PolicyError, PolicySnapshot, RequestContext,
    RouteDecision, Rubric, RubricEvaluator, Task, TaskFailure, TaskGraph, TaskId, TaskSpec,
    TaskState, TaskType,
};

use crate::cache::EvaluationCache;
use crate::config::{RuntimeConfig, TiersConfig};
use crate::decision_log::DecisionLog;
use crate::executor::{cancelled, ExecutionContext, ExecutionReport, Outcome, TaskExecutor};
use crate::persistence::{BufferedWriter, PersistenceSink, WriteOp};
use crate::policy_store::PolicyStore;
use crate::providers::{ProviderAdapter, ProviderRegistry};
use crate::resilience::{BackoffPolicy, CostGuard, Ledger};
use crate::router::PolicyRouter;
use crate::telemetry::{task_attempt_span, Metrics};
use crate::RuntimeError;

/// A request to run a task graph.
#[derive(Debug, Clone)]
pub struct Command {
    /// Empty to have one generated
    pub job_id: JobId,
    pub graph: TaskGraph,
    pub tier: BudgetTier,
    pub pii_level: PiiLevel,
    pub correlation_id: Option<String>,
}

impl Command {
    pub fn new(graph: TaskGraph, tier: BudgetTier, pii_level: PiiLevel) -> Self {
        Self {
            job_id: String::new(),
            graph,
            tier,
            pii_level,
            correlation_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Synchronous answer to a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job_id: JobId,
    pub correlation_id: String,
    pub initial_state: JobState,
}

/// Terminal view of a job: final states plus the full audit trail.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub correlation_id: String,
    pub state: JobState,
    pub tasks: BTreeMap<TaskId, Task>,
    pub decisions: Vec<DecisionRecord>,
    pub evaluations: Vec<EvaluationResult>,
    /// Most recent evaluation per task
    pub last_evaluations: BTreeMap<TaskId, EvaluationResult>,
    pub budget: Ledger,
    /// Some write for this job was refused or dropped
    pub persistence_degraded: bool,
}

impl JobReport {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Decision records of one task, in log order.
    pub fn trail(&self, task_id: &str) -> Vec<&DecisionRecord> {
        self.decisions
            .iter()
            .filter(|r| r.task_id.as_deref() == Some(task_id))
            .collect()
    }

    pub fn evaluations_of(&self, task_id: &str) -> Vec<&EvaluationResult> {
        self.evaluations
            .iter()
            .filter(|e| e.task_id == task_id)
            .collect()
    }
}

/// Handle to a running job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    cancel: watch::Sender<bool>,
    driver: JoinHandle<Result<JobReport, RuntimeError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Signal cancellation to the driver and every in-flight attempt.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(self) -> Result<JobReport, RuntimeError> {
        match self.driver.await {
            Ok(result) => result,
            Err(e) => Err(RuntimeError::JobAborted(format!(
                "driver of job '{}' stopped: {}",
                self.job_id, e
            ))),
        }
    }
}

struct RunnerShared {
    config: RuntimeConfig,
    router: PolicyRouter,
    executor: TaskExecutor,
    guard: Arc<CostGuard>,
    log: Arc<DecisionLog>,
    evaluator: Arc<dyn Evaluator>,
    cache: EvaluationCache,
    metrics: Arc<Metrics>,
    pools: HashMap<BudgetTier, Arc<Semaphore>>,
    active: Mutex<HashSet<JobId>>,
    backoff: BackoffPolicy,
}

/// Accepts jobs and drives them to completion.
#[derive(Clone)]
pub struct WorkflowRunner {
    shared: Arc<RunnerShared>,
}

/// Builder for [`WorkflowRunner`].
pub struct WorkflowRunnerBuilder {
    config: RuntimeConfig,
    policy: Option<Arc<PolicyStore>>,
    registry: ProviderRegistry,
    evaluator: Option<Arc<dyn Evaluator>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    metrics: Option<Arc<Metrics>>,
}

impl WorkflowRunnerBuilder {
    fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            policy: None,
            registry: ProviderRegistry::new(),
            evaluator: None,
            sink: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, document: PolicyDocument) -> Self {
        self.policy = Some(Arc::new(PolicyStore::new(document)));
        self
    }

    /// Share a store so reloads reach running jobs.
    pub fn policy_store(mut self, store: Arc<PolicyStore>) -> Self {
        self.policy = Some(store);
        self
    }

    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn provider(mut self, name: &str, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.registry.insert(name, adapter);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Persist jobs, tasks, decisions and evaluations through `sink`.
    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Must be called inside a tokio runtime when a sink is set.
    pub fn build(self) -> Result<WorkflowRunner, RuntimeError> {
        self.config.validate()?;
        let store = self
            .policy
            .ok_or_else(|| RuntimeError::NotConfigured("a routing policy is required".into()))?;
        let metrics = self.metrics.unwrap_or_default();
        let config = self.config;

        let log = Arc::new(match self.sink {
            Some(sink) => DecisionLog::with_writer(Arc::new(BufferedWriter::spawn(
                sink,
                &config.persistence,
                metrics.clone(),
            ))),
            None => DecisionLog::new(),
        });
        let guard = Arc::new(CostGuard::new(
            config.tiers.clone(),
            config.breaker.clone(),
            metrics.clone(),
        ));
        let router = PolicyRouter::new(store, log.clone(), metrics.clone());
        let executor = TaskExecutor::new(
            Arc::new(self.registry),
            guard.clone(),
            log.clone(),
            config.executor.clone(),
        );
        let pools = BudgetTier::ALL
            .into_iter()
            .map(|tier| {
                let size = config.tiers.get(tier).worker_pool_size;
                (tier, Arc::new(Semaphore::new(size)))
            })
            .collect();

        Ok(WorkflowRunner {
            shared: Arc::new(RunnerShared {
                router,
                executor,
                guard,
                log,
                evaluator: self.evaluator.unwrap_or_else(|| Arc::new(RubricEvaluator::new())),
                cache: EvaluationCache::from_config(&config.cache),
                metrics,
                pools,
                active: Mutex::new(HashSet::new()),
                backoff: BackoffPolicy::new(config.runner.base_backoff).with_jitter(),
                config,
            }),
        })
    }
}

impl WorkflowRunner {
    pub fn builder() -> WorkflowRunnerBuilder {
        WorkflowRunnerBuilder::new()
    }

    /// Validate and start a job.
    ///
    /// Fails without starting anything when the graph is malformed, the job
    /// id is already running, or some task has no route at any tier it could
    /// reach. Must be called inside a tokio runtime.
    pub fn submit(&self, command: Command) -> Result<(Submission, JobHandle), RuntimeError> {
        let shared = &self.shared;
        let job_id = if command.job_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            command.job_id
        };
        let correlation_id = command
            .correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let job = Job::new(
            job_id.clone(),
            correlation_id.clone(),
            command.graph,
            command.tier,
            command.pii_level,
        )?;

        let snapshot = shared.router.store().snapshot();
        for spec in &job.graph.tasks {
            if reachable_tier(
                &snapshot,
                &shared.config.tiers,
                spec.task_type,
                job.pii_level,
                job.tier,
                &BTreeSet::new(),
            )
            .is_none()
            {
                shared.metrics.route_rejected();
                tracing::warn!(
                    job_id = %job_id,
                    task_id = %spec.id,
                    task_type = %spec.task_type,
                    "Submission rejected: task has no route"
                );
                return Err(PolicyError::NoPolicyMatch {
                    task_type: spec.task_type,
                    pii_level: job.pii_level,
                    tier: job.tier,
                }
                .into());
            }
        }

        if !shared.active.lock().insert(job_id.clone()) {
            return Err(RuntimeError::DuplicateJob(job_id));
        }

        shared.log.register_job(&job_id, &correlation_id);
        shared.guard.open_job(&job_id, job.tier);

        tracing::info!(
            job_id = %job_id,
            correlation_id = %correlation_id,
            tier = %job.tier,
            pii = %job.pii_level,
            tasks = job.graph.len(),
            "Job submitted"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let driver = JobDriver::new(shared.clone(), job, cancel_rx);
        let driver = tokio::spawn({
            let shared = shared.clone();
            let job_id = job_id.clone();
            async move {
                let result = driver.run().await;
                shared.active.lock().remove(&job_id);
                result
            }
        });

        let submission = Submission {
            job_id: job_id.clone(),
            correlation_id,
            initial_state: JobState::Pending,
        };
        Ok((
            submission,
            JobHandle {
                job_id,
                cancel: cancel_tx,
                driver,
            },
        ))
    }

    /// Submit and wait for the terminal report.
    pub async fn run(&self, command: Command) -> Result<JobReport, RuntimeError> {
        let (_, handle) = self.submit(command)?;
        handle.wait().await
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    pub fn cost_guard(&self) -> &Arc<CostGuard> {
        &self.shared.guard
    }

    pub fn decision_log(&self) -> &Arc<DecisionLog> {
        &self.shared.log
    }

    pub fn policy_store(&self) -> &Arc<PolicyStore> {
        self.shared.router.store()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Drain the persistence buffer. Jobs still running keep running but
    /// their later writes are refused.
    pub async fn shutdown(&self) {
        if let Some(writer) = self.shared.log.writer() {
            writer.shutdown().await;
        }
    }
}

/// First tier, starting at `tier` and stepping down while the tier config
/// allows it, at which some non-excluded rule matches.
pub fn reachable_tier(
    snapshot: &PolicySnapshot,
    tiers: &TiersConfig,
    task_type: TaskType,
    pii_level: PiiLevel,
    mut tier: BudgetTier,
    excluded: &BTreeSet<String>,
) -> Option<BudgetTier> {
    loop {
        if snapshot
            .first_match(task_type, pii_level, tier, excluded)
            .is_some()
        {
            return Some(tier);
        }
        if !tiers.get(tier).allow_downgrade {
            return None;
        }
        tier = tier.downgrade()?;
    }
}

struct AttemptDone {
    task_id: TaskId,
    attempt: u32,
    report: ExecutionReport,
    evaluation: Option<EvaluationResult>,
}

async fn run_attempt(
    shared: Arc<RunnerShared>,
    ctx: ExecutionContext,
    route: RouteDecision,
    rubric: Option<Rubric>,
) -> AttemptDone {
    let mut cancel = ctx.cancel.clone();
    let done = |report: ExecutionReport, evaluation: Option<EvaluationResult>| AttemptDone {
        task_id: ctx.spec.id.clone(),
        attempt: ctx.attempt,
        report,
        evaluation,
    };

    let _permit = match shared.pools.get(&ctx.tier).cloned() {
        Some(pool) => tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                return done(ExecutionReport::cancelled("cancelled while waiting for a worker"), None);
            }
            permit = pool.acquire_owned() => permit.ok(),
        },
        None => None,
    };

    let report = shared.executor.execute(&ctx, &route).await;

    let evaluation = match (&report.outcome, &report.response, &rubric) {
        (Outcome::Success, Some(response), Some(rubric)) => {
            let artifact = Artifact::new(&ctx.spec.id, ctx.attempt, response.content.clone())
                .with_evidence(response.evidence.clone())
                .with_model(response.model.clone());
            let (result, hit) = shared
                .cache
                .get_or_score(shared.evaluator.as_ref(), &artifact, rubric)
                .await;
            shared.metrics.evaluation(hit);
            tracing::debug!(
                rubric = %result.rubric_id,
                value = result.value,
                passed = result.passed,
                cache_hit = hit,
                "Artifact scored"
            );
            Some(result)
        }
        _ => None,
    };

    done(report, evaluation)
}

/// Owns one job until it settles.
struct JobDriver {
    shared: Arc<RunnerShared>,
    job: Job,
    cancel_rx: watch::Receiver<bool>,
    /// Tells in-flight attempts to wind down; set by cancellation and by
    /// persistence failure
    stop_tx: watch::Sender<bool>,
    admitted_tx: mpsc::UnboundedSender<(TaskId, u32)>,
    admitted_rx: mpsc::UnboundedReceiver<(TaskId, u32)>,
    workers: JoinSet<AttemptDone>,
    in_flight: HashMap<tokio::task::Id, TaskId>,
    sleepers: JoinSet<TaskId>,
    last_evaluations: BTreeMap<TaskId, EvaluationResult>,
    /// Set once the job is being torn down, with the kind unfinished tasks fail with
    stopping: Option<FailureKind>,
}

impl JobDriver {
    fn new(shared: Arc<RunnerShared>, job: Job, cancel_rx: watch::Receiver<bool>) -> Self {
        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared,
            job,
            cancel_rx,
            stop_tx,
            admitted_tx,
            admitted_rx,
            workers: JoinSet::new(),
            in_flight: HashMap::new(),
            sleepers: JoinSet::new(),
            last_evaluations: BTreeMap::new(),
            stopping: None,
        }
    }

    async fn run(mut self) -> Result<JobReport, RuntimeError> {
        let result = self.drive().await;
        if let Err(e) = &result {
            tracing::error!(job_id = %self.job.id, error = %e, "Job driver failed");
            self.workers.abort_all();
            self.sleepers.abort_all();
            self.shared.guard.close_job(&self.job.id);
            self.shared.log.take_job(&self.job.id);
            return Err(RuntimeError::JobAborted(format!("job '{}': {}", self.job.id, e)));
        }
        self.finish().await
    }

    async fn drive(&mut self) -> Result<(), RuntimeError> {
        self.job.start();
        self.shared
            .log
            .persist(WriteOp::Job(Box::new(self.job.clone())));

        let grace = self.shared.config.runner.cancel_grace;
        let mut cancel = self.cancel_rx.clone();

        loop {
            if self.shared.log.persistence_failed(&self.job.id) {
                return self
                    .stop(
                        FailureKind::Persistence,
                        "pending writes exceeded the persistence buffer",
                        grace,
                    )
                    .await;
            }
            if *cancel.borrow() {
                return self.stop(FailureKind::Cancelled, "job cancelled", grace).await;
            }

            self.dispatch()?;
            if self.workers.is_empty() && self.sleepers.is_empty() {
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {}
                Some(notice) = self.admitted_rx.recv() => self.on_admitted(notice)?,
                Some(joined) = self.workers.join_next_with_id() => self.on_joined(joined)?,
                Some(slept) = self.sleepers.join_next() => self.on_backoff_elapsed(slept)?,
            }
        }
    }

    async fn finish(mut self) -> Result<JobReport, RuntimeError> {
        let completion = &self.shared.config.completion;
        let mut state = self.job.settle(|spec| completion.is_required(spec));
        if self.stopping == Some(FailureKind::Persistence) {
            state = JobState::Failed;
        }
        self.job.state = state;

        let budget = self
            .shared
            .guard
            .close_job(&self.job.id)
            .unwrap_or_default();
        self.shared
            .log
            .persist(WriteOp::Job(Box::new(self.job.clone())));
        if let Some(writer) = self.shared.log.writer() {
            if let Err(e) = writer.flush().await {
                tracing::warn!(job_id = %self.job.id, error = %e, "Final flush failed");
            }
        }

        let trail = self.shared.log.take_job(&self.job.id);
        let persistence_degraded = trail.persistence_failed;
        tracing::info!(
            job_id = %self.job.id,
            state = %state,
            spent_usd = budget.spent_usd,
            persistence_degraded,
            "Job finished"
        );

        Ok(JobReport {
            decisions: trail.records,
            evaluations: trail.evaluations,
            job_id: self.job.id,
            correlation_id: self.job.correlation_id,
            state,
            tasks: self.job.tasks,
            last_evaluations: self.last_evaluations,
            budget,
            persistence_degraded,
        })
    }

    /// Route every runnable task and start its attempt.
    fn dispatch(&mut self) -> Result<(), RuntimeError> {
        for task_id in self.job.runnable() {
            let (ctx, spec) = {
                let task = self.task(&task_id)?;
                let spec = self
                    .job
                    .spec(&task_id)
                    .cloned()
                    .ok_or_else(|| RuntimeError::UnknownTask(task_id.clone()))?;
                let ctx = RequestContext {
                    job_id: self.job.id.clone(),
                    task_id: task_id.clone(),
                    attempt: task.attempt,
                    task_type: task.task_type,
                    pii_level: self.job.pii_level,
                    budget_tier: task.effective_tier,
                    spend: self
                        .shared
                        .guard
                        .spend_snapshot(&self.job.id)
                        .unwrap_or_default(),
                    excluded_rules: task.excluded_rules.clone(),
                };
                (ctx, spec)
            };

            match self.shared.router.route(&ctx) {
                Ok(route) => {
                    self.task_mut(&task_id)?.route = Some(route.clone());
                    self.transition(
                        &task_id,
                        TaskState::Routed,
                        format!("rule '{}' via {:?}", route.rule_id, route.provider_order),
                    )?;
                    self.spawn_attempt(spec, route)?;
                }
                Err(e) => self.fail_task(&task_id, FailureKind::NoRoute, e.to_string())?,
            }
        }
        Ok(())
    }

    fn spawn_attempt(&mut self, spec: TaskSpec, route: RouteDecision) -> Result<(), RuntimeError> {
        let task = self.task(&spec.id)?;
        let (attempt, tier) = (task.attempt, task.effective_tier);

        let rubric = spec
            .rubric
            .clone()
            .or_else(|| self.shared.config.rubrics.get(&spec.task_type).cloned());
        let span = task_attempt_span(&self.job.id, &spec.id, attempt, &self.job.correlation_id);
        let task_id = spec.id.clone();

        let ctx = ExecutionContext {
            job_id: self.job.id.clone(),
            correlation_id: self.job.correlation_id.clone(),
            attempt,
            tier,
            pii_level: self.job.pii_level,
            spec,
            cancel: self.stop_tx.subscribe(),
            on_admit: Some(self.admitted_tx.clone()),
        };

        let handle = self
            .workers
            .spawn(run_attempt(self.shared.clone(), ctx, route, rubric).instrument(span));
        self.in_flight.insert(handle.id(), task_id);
        Ok(())
    }

    fn on_admitted(&mut self, (task_id, attempt): (TaskId, u32)) -> Result<(), RuntimeError> {
        let task = self.task(&task_id)?;
        if task.attempt == attempt && task.state == TaskState::Routed {
            self.transition(&task_id, TaskState::Executing, "provider call admitted")?;
        }
        Ok(())
    }

    fn drain_admissions(&mut self) -> Result<(), RuntimeError> {
        while let Ok(notice) = self.admitted_rx.try_recv() {
            self.on_admitted(notice)?;
        }
        Ok(())
    }

    fn on_joined(
        &mut self,
        joined: Result<(tokio::task::Id, AttemptDone), JoinError>,
    ) -> Result<(), RuntimeError> {
        match joined {
            Ok((id, done)) => {
                self.in_flight.remove(&id);
                self.on_finished(done)
            }
            Err(e) => {
                let Some(task_id) = self.in_flight.remove(&e.id()) else {
                    return Ok(());
                };
                let kind = match self.stopping {
                    Some(kind) if e.is_cancelled() => kind,
                    _ => FailureKind::ProviderRejected,
                };
                self.fail_task(&task_id, kind, format!("attempt worker stopped: {}", e))
            }
        }
    }

    fn on_finished(&mut self, done: AttemptDone) -> Result<(), RuntimeError> {
        self.drain_admissions()?;
        let AttemptDone {
            task_id,
            attempt,
            report,
            evaluation,
        } = done;
        let job_id = self.job.id.clone();

        let task = self.task_mut(&task_id)?;
        if task.attempt != attempt || task.is_terminal() {
            tracing::debug!(task_id = %task_id, attempt, "Ignoring stale attempt result");
            return Ok(());
        }
        task.cost_actual_usd += report.cost_actual_usd;
        task.latency_actual_ms += report.latency_actual_ms;
        let needs_executing = task.state == TaskState::Routed && report.admitted;
        if needs_executing {
            self.transition(&task_id, TaskState::Executing, "provider call admitted")?;
        }

        if let Some(result) = &evaluation {
            self.shared.log.record(
                &job_id,
                &task_id,
                attempt,
                DecisionKind::Evaluated {
                    passed: result.passed,
                    value: result.value,
                },
                format!(
                    "rubric '{}' v{}: {}",
                    result.rubric_id, result.rubric_version, result.rationale
                ),
                None,
            );
            self.shared.log.append_evaluation(&job_id, result.clone());
            self.last_evaluations.insert(task_id.clone(), result.clone());
        }

        match report.outcome {
            Outcome::Success => {
                if let Some(result) = evaluation.filter(|r| !r.passed) {
                    return self.retry_or_fail(
                        &task_id,
                        FailureKind::QualityBelowThreshold,
                        format!("score {:.3} below threshold: {}", result.value, result.rationale),
                    );
                }
                self.task_mut(&task_id)?.output = report.response.map(|r| r.content);
                self.transition(&task_id, TaskState::Succeeded, report.message)
            }
            Outcome::RetriableFailure { kind } => {
                self.retry_or_fail(&task_id, kind, report.message)
            }
            Outcome::FatalFailure { kind } => {
                let kind = match self.stopping {
                    Some(stop_kind) if kind == FailureKind::Cancelled => stop_kind,
                    _ => kind,
                };
                self.fail_task(&task_id, kind, report.message)
            }
        }
    }

    /// Decide between another attempt and giving up.
    fn retry_or_fail(
        &mut self,
        task_id: &str,
        kind: FailureKind,
        message: String,
    ) -> Result<(), RuntimeError> {
        if let Some(stop_kind) = self.stopping {
            return self.fail_task(task_id, stop_kind, message);
        }
        if !kind.is_retriable() {
            return self.fail_task(task_id, kind, message);
        }

        let max_attempts = self.shared.config.runner.max_attempts;
        let pii_level = self.job.pii_level;
        let snapshot = self.shared.router.store().snapshot();
        let tiers = &self.shared.config.tiers;

        let task = self
            .job
            .task_mut(task_id)
            .ok_or_else(|| RuntimeError::UnknownTask(task_id.to_string()))?;
        let attempt = task.attempt;
        task.failure = Some(TaskFailure {
            kind,
            message: message.clone(),
            attempt,
        });

        if kind.triggers_reroute() {
            if let Some(route) = &task.route {
                task.excluded_rules.insert(route.rule_id.clone());
            }
            match reachable_tier(
                &snapshot,
                tiers,
                task.task_type,
                pii_level,
                task.effective_tier,
                &task.excluded_rules,
            ) {
                Some(tier) if tier != task.effective_tier => {
                    tracing::info!(
                        task_id = %task_id,
                        from = %task.effective_tier,
                        to = %tier,
                        "Downgrading task tier"
                    );
                    task.effective_tier = tier;
                }
                Some(_) => {}
                None => {
                    return self.fail_task(
                        task_id,
                        kind,
                        format!("{}; no alternative route", message),
                    );
                }
            }
        }

        if attempt >= max_attempts {
            return self.fail_task(
                task_id,
                FailureKind::AttemptsExhausted,
                format!(
                    "{} of {} attempts used; last failure {}: {}",
                    attempt, max_attempts, kind, message
                ),
            );
        }

        let ceiling = tiers.get(task.effective_tier).max_backoff;
        let delay = self.shared.backoff.delay(attempt, ceiling);
        self.transition(task_id, TaskState::Retrying, format!("{}: {}", kind, message))?;
        tracing::debug!(task_id = %task_id, attempt, ?delay, "Retry scheduled");

        let task_id = task_id.to_string();
        self.sleepers.spawn(async move {
            tokio::time::sleep(delay).await;
            task_id
        });
        Ok(())
    }

    fn on_backoff_elapsed(&mut self, slept: Result<TaskId, JoinError>) -> Result<(), RuntimeError> {
        let Ok(task_id) = slept else {
            return Ok(());
        };
        let task = self.task_mut(&task_id)?;
        if task.state != TaskState::Retrying {
            return Ok(());
        }
        let from = task.requeue()?;
        let snapshot = task.clone();
        self.shared.metrics.retry();
        self.record_transition(&snapshot, from, TaskState::Queued, "backoff elapsed".into());
        Ok(())
    }

    /// Fail unfinished tasks with `kind`, waiting up to `grace` for
    /// in-flight attempts to wind down.
    async fn stop(
        &mut self,
        kind: FailureKind,
        reason: &str,
        grace: Duration,
    ) -> Result<(), RuntimeError> {
        self.stopping = Some(kind);
        self.stop_tx.send_replace(true);
        tracing::warn!(job_id = %self.job.id, kind = %kind, reason, "Stopping job");
        self.sleepers.abort_all();

        let idle: Vec<TaskId> = self
            .job
            .tasks
            .values()
            .filter(|t| !t.is_terminal() && !self.in_flight.values().any(|id| *id == t.id))
            .map(|t| t.id.clone())
            .collect();
        for task_id in idle {
            self.fail_task(&task_id, kind, reason.to_string())?;
        }

        let deadline = Instant::now() + grace;
        while !self.workers.is_empty() {
            let next = tokio::select! {
                biased;
                Some(notice) = self.admitted_rx.recv() => {
                    self.on_admitted(notice)?;
                    continue;
                }
                next = tokio::time::timeout_at(deadline, self.workers.join_next_with_id()) => next,
            };
            match next {
                Ok(Some(joined)) => self.on_joined(joined)?,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(job_id = %self.job.id, in_flight = self.workers.len(), "Grace period elapsed, aborting attempts");
                    self.workers.abort_all();
                    while let Some(joined) = self.workers.join_next_with_id().await {
                        self.on_joined(joined)?;
                    }
                }
            }
        }

        let rest: Vec<TaskId> = self
            .job
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for task_id in rest {
            self.fail_task(&task_id, kind, reason.to_string())?;
        }
        Ok(())
    }

    fn fail_task(
        &mut self,
        task_id: &str,
        kind: FailureKind,
        message: String,
    ) -> Result<(), RuntimeError> {
        let task = self.task_mut(task_id)?;
        if task.is_terminal() {
            return Ok(());
        }
        let from = task.fail(kind, message.clone())?;
        let snapshot = task.clone();
        tracing::warn!(
            job_id = %snapshot.job_id,
            task_id = %task_id,
            attempt = snapshot.attempt,
            kind = %kind,
            message = %message,
            "Task failed"
        );
        self.record_transition(
            &snapshot,
            from,
            TaskState::FailedFatal,
            format!("{}: {}", kind, message),
        );

        for blocked in self.job.block_dependents(task_id) {
            if let Some(task) = self.job.task(&blocked).cloned() {
                self.record_transition(
                    &task,
                    TaskState::Queued,
                    TaskState::FailedFatal,
                    format!("{}: dependency '{}' failed", FailureKind::DependencyFailed, task_id),
                );
            }
        }
        Ok(())
    }

    fn transition(
        &mut self,
        task_id: &str,
        to: TaskState,
        reason: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let task = self.task_mut(task_id)?;
        let from = task.transition(to)?;
        let snapshot = task.clone();
        self.record_transition(&snapshot, from, to, reason.into());
        Ok(())
    }

    fn record_transition(&self, task: &Task, from: TaskState, to: TaskState, reason: String) {
        tracing::debug!(
            job_id = %task.job_id,
            task_id = %task.id,
            attempt = task.attempt,
            %from,
            %to,
            "Task transition"
        );
        self.shared.log.record(
            &task.job_id,
            &task.id,
            task.attempt,
            DecisionKind::Transition { from, to },
            reason,
            None,
        );
        self.shared
            .log
            .persist(WriteOp::Task(Box::new(task.clone())));
    }

    fn task(&self, task_id: &str) -> Result<&Task, RuntimeError> {
        self.job
            .task(task_id)
            .ok_or_else(|| RuntimeError::UnknownTask(task_id.to_string()))
    }

    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task, RuntimeError> {
        self.job
            .task_mut(task_id)
            .ok_or_else(|| RuntimeError::UnknownTask(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
version: "1"
rules:
  - id: premium-generate
    match: { task: generate, budgetTier: premium }
    choose: { providerOrder: [openai], model: big, maxCostUsd: 1.0, latencyP95Ms: 5000, contextPolicy: no_pii }
  - id: economy-generate
    match: { task: generate, budgetTier: economy }
    choose: { providerOrder: [local], model: small, maxCostUsd: 0.05, latencyP95Ms: 2000, contextPolicy: no_pii }
"#;

    fn snapshot() -> PolicySnapshot {
        PolicySnapshot::new(PolicyDocument::from_yaml(POLICY).unwrap())
    }

    #[test]
    fn test_reachable_tier_walks_down_while_allowed() {
        let tiers = TiersConfig::default();
        let none = BTreeSet::new();

        assert_eq!(
            reachable_tier(&snapshot(), &tiers, TaskType::Generate, PiiLevel::None, BudgetTier::Premium, &none),
            Some(BudgetTier::Premium)
        );
        // standard has no rule but may downgrade to economy
        assert_eq!(
            reachable_tier(&snapshot(), &tiers, TaskType::Generate, PiiLevel::None, BudgetTier::Standard, &none),
            Some(BudgetTier::Economy)
        );
        assert_eq!(
            reachable_tier(&snapshot(), &tiers, TaskType::Render, PiiLevel::None, BudgetTier::Premium, &none),
            None
        );
    }

    #[test]
    fn test_reachable_tier_respects_exclusions_and_downgrade_flag() {
        let mut tiers = TiersConfig::default();
        let excluded: BTreeSet<String> = ["premium-generate".to_string()].into();
        assert_eq!(
            reachable_tier(&snapshot(), &tiers, TaskType::Generate, PiiLevel::None, BudgetTier::Premium, &excluded),
            Some(BudgetTier::Economy)
        );

        tiers.premium.allow_downgrade = false;
        assert_eq!(
            reachable_tier(&snapshot(), &tiers, TaskType::Generate, PiiLevel::None, BudgetTier::Premium, &excluded),
            None
        );
    }

    #[test]
    fn test_build_requires_policy() {
        let result = WorkflowRunner::builder().build();
        assert!(matches!(result, Err(RuntimeError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_unroutable_graph() {
        let runner = WorkflowRunner::builder()
            .policy(PolicyDocument::from_yaml(POLICY).unwrap())
            .build()
            .unwrap();
        let graph = TaskGraph::new(vec![TaskSpec::new("r", TaskType::Render)]);

        let err = runner
            .submit(Command::new(graph, BudgetTier::Premium, PiiLevel::None))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Policy(PolicyError::NoPolicyMatch { .. })));
        assert!(runner.decision_log().records_for("anything").is_empty());
    }
}
