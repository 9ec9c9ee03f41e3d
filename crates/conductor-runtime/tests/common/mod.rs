//! Shared fixtures for runtime integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{
    DecisionKind, DecisionRecord, PolicyDocument, TaskGraph, TaskSpec, TaskState, TaskType,
};
use conductor_runtime::providers::{CostEstimate, TokenUsage};
use conductor_runtime::{
    InvokeRequest, ProviderAdapter, ProviderError, ProviderResponse, RuntimeConfig,
    WorkflowRunner, WorkflowRunnerBuilder,
};

/// Provider whose replies are scripted per call.
///
/// Queued replies are consumed first; afterwards the reply configured for
/// the request's model is returned, or `"ok"`.
pub struct ScriptedProvider {
    name: String,
    queue: Mutex<VecDeque<Result<String, ProviderError>>>,
    by_model: Mutex<BTreeMap<String, String>>,
    estimate_usd: f64,
    cost_usd: f64,
    delay: Duration,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            by_model: Mutex::new(BTreeMap::new()),
            estimate_usd: 0.01,
            cost_usd: 0.01,
            delay: Duration::from_millis(20),
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    pub fn then_ok(self, content: &str) -> Self {
        self.queue.lock().push_back(Ok(content.to_string()));
        self
    }

    pub fn then_err(self, error: ProviderError) -> Self {
        self.queue.lock().push_back(Err(error));
        self
    }

    pub fn for_model(self, model: &str, content: &str) -> Self {
        self.by_model
            .lock()
            .insert(model.to_string(), content.to_string());
        self
    }

    pub fn estimate(mut self, usd: f64) -> Self {
        self.estimate_usd = usd;
        self
    }

    pub fn cost(mut self, usd: f64) -> Self {
        self.cost_usd = usd;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn models_seen(&self) -> Vec<String> {
        self.models.lock().clone()
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn invoke(&self, request: &InvokeRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().push(request.model.clone());
        tokio::time::sleep(self.delay).await;

        let scripted = self.queue.lock().pop_front();
        let content = match scripted {
            Some(reply) => reply?,
            None => self
                .by_model
                .lock()
                .get(&request.model)
                .cloned()
                .unwrap_or_else(|| "ok".to_string()),
        };

        Ok(ProviderResponse {
            content,
            evidence: Vec::new(),
            cost_usd: self.cost_usd,
            latency_ms: self.delay.as_millis() as u64,
            model: request.model.clone(),
            usage: TokenUsage::default(),
        })
    }

    fn estimate(&self, _request: &InvokeRequest) -> CostEstimate {
        CostEstimate {
            cost_usd: self.estimate_usd,
            latency_ms: self.delay.as_millis() as u64,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn policy(yaml: &str) -> PolicyDocument {
    PolicyDocument::from_yaml(yaml).expect("test policy must parse")
}

/// Config with short backoff so paused-clock tests stay quick.
pub fn fast_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.runner.base_backoff = Duration::from_millis(10);
    config.runner.cancel_grace = Duration::from_millis(200);
    config
}

pub fn builder(yaml: &str) -> WorkflowRunnerBuilder {
    WorkflowRunner::builder()
        .config(fast_config())
        .policy(policy(yaml))
}

pub fn single(id: &str, task_type: TaskType) -> TaskGraph {
    TaskGraph::new(vec![TaskSpec::new(id, task_type)])
}

/// Target states of the task's transitions, in order.
pub fn transitions(records: &[&DecisionRecord]) -> Vec<TaskState> {
    records
        .iter()
        .filter_map(|r| match r.kind {
            DecisionKind::Transition { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

/// `(success, attempt)` of every provider call in the trail.
pub fn executions(records: &[&DecisionRecord]) -> Vec<(bool, u32)> {
    records
        .iter()
        .filter_map(|r| match &r.kind {
            DecisionKind::Executed { success, .. } => Some((*success, r.attempt)),
            _ => None,
        })
        .collect()
}
