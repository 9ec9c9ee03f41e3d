//! Task graphs: the directed acyclic plan a job executes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::evaluator::Rubric;
use crate::types::{TaskId, TaskType};

/// Errors from graph validation.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("task graph is empty")]
    Empty,

    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("task '{0}' depends on itself")]
    SelfDependency(TaskId),

    #[error("task graph has a cycle through: {}", .0.join(", "))]
    Cycle(Vec<TaskId>),

    #[error("task '{task}' has an invalid rubric: {reason}")]
    InvalidRubric { task: TaskId, reason: String },

    #[error("failed to read task graph: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One node of a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,

    #[serde(rename = "type", alias = "task_type")]
    pub task_type: TaskType,

    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<TaskId>,

    /// Overrides the completion policy for this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    /// Opaque input handed to the provider
    #[serde(default)]
    pub input: serde_json::Value,

    /// Overrides the configured rubric for this task type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<Rubric>,

    /// JSON Schema the response content must satisfy
    #[serde(default, alias = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,

    /// Caller's cost hint; providers' own estimates win when higher
    #[serde(default, alias = "estimatedCostUsd", skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            task_type,
            depends_on: Vec::new(),
            required: None,
            input: serde_json::Value::Null,
            rubric: None,
            output_schema: None,
            estimated_cost_usd: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = Some(false);
        self
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = Some(rubric);
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_estimated_cost(mut self, usd: f64) -> Self {
        self.estimated_cost_usd = Some(usd);
        self
    }
}

/// A set of tasks with dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub tasks: Vec<TaskSpec>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Parse a graph from YAML (either `{tasks: [...]}` or a bare list).
    pub fn from_yaml(yaml: &str) -> Result<Self, GraphError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Wrapped { tasks: Vec<TaskSpec> },
            Bare(Vec<TaskSpec>),
        }

        let graph = match serde_yaml::from_str::<Raw>(yaml)? {
            Raw::Wrapped { tasks } | Raw::Bare(tasks) => Self { tasks },
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let graph: Self = serde_json::from_str(json)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn get(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Structural validation: non-empty, unique ids, known deps, acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut ids = BTreeSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if *dep == task.id {
                    return Err(GraphError::SelfDependency(task.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            if let Some(rubric) = &task.rubric {
                rubric.validate().map_err(|e| GraphError::InvalidRubric {
                    task: task.id.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        self.waves().map(|_| ())
    }

    /// Tasks in a dependency-respecting order (declaration order breaks ties).
    pub fn topological_order(&self) -> Result<Vec<&TaskSpec>, GraphError> {
        Ok(self.waves()?.into_iter().flatten().collect())
    }

    /// Groups of tasks that may run concurrently, in order (Kahn's algorithm).
    pub fn waves(&self) -> Result<Vec<Vec<&TaskSpec>>, GraphError> {
        let position: BTreeMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if let Some(&d) = position.get(dep.as_str()) {
                    indegree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..self.tasks.len()).filter(|&i| indegree[i] == 0).collect();
        let mut waves = Vec::new();
        let mut visited = 0;

        while !ready.is_empty() {
            let mut wave: Vec<usize> = ready.drain(..).collect();
            wave.sort_unstable();
            let mut next = Vec::new();
            for &i in &wave {
                visited += 1;
                for &child in &dependents[i] {
                    indegree[child] -= 1;
                    if indegree[child] == 0 {
                        next.push(child);
                    }
                }
            }
            ready.extend(next);
            waves.push(wave.into_iter().map(|i| &self.tasks[i]).collect());
        }

        if visited < self.tasks.len() {
            let stuck = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, t)| t.id.clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        Ok(waves)
    }
}
