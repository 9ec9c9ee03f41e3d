//! Evaluation result cache.
//!
//! Scoring is a pure function of (artifact content and evidence, rubric), so
//! retries that reproduce an identical artifact reuse the earlier result.

use moka::future::Cache;
use std::time::Duration;

use conductor_core::{Artifact, EvaluationResult, Evaluator, Rubric};

use crate::config::CacheConfig;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    artifact_digest: u64,
    rubric_id: String,
    rubric_version: String,
}

impl CacheKey {
    pub fn new(artifact: &Artifact, rubric: &Rubric) -> Self {
        Self {
            artifact_digest: artifact.digest(),
            rubric_id: rubric.id.clone(),
            rubric_version: rubric.version.clone(),
        }
    }
}

pub struct EvaluationCache {
    cache: Cache<CacheKey, EvaluationResult>,
}

impl EvaluationCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl)
    }

    /// Score `artifact`, reusing a cached result when one exists.
    ///
    /// Returns the result (stamped with this artifact's task and attempt)
    /// and whether it came from the cache.
    pub async fn get_or_score(
        &self,
        evaluator: &dyn Evaluator,
        artifact: &Artifact,
        rubric: &Rubric,
    ) -> (EvaluationResult, bool) {
        let key = CacheKey::new(artifact, rubric);

        if let Some(mut cached) = self.cache.get(&key).await {
            cached.task_id = artifact.task_id.clone();
            cached.attempt = artifact.attempt;
            return (cached, true);
        }

        let result = evaluator.score(artifact, rubric);
        self.cache.insert(key, result.clone()).await;
        (result, false)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for EvaluationCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
