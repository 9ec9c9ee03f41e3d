//! Runtime configuration.
//!
//! Loaded from YAML with human-readable durations (`"250ms"`, `"30s"`), then
//! optionally overridden from the environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use conductor_core::{BudgetTier, Rubric, TaskSpec, TaskType};

/// Environment variable overriding `runner.max_attempts`.
pub const ENV_MAX_ATTEMPTS: &str = "CONDUCTOR_MAX_ATTEMPTS";
/// Environment variable overriding `persistence.buffer_capacity`.
pub const ENV_PERSIST_BUFFER: &str = "CONDUCTOR_PERSIST_BUFFER";
/// Environment variable overriding `executor.admission_wait`.
pub const ENV_ADMISSION_WAIT: &str = "CONDUCTOR_ADMISSION_WAIT";

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value '{value}' for {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod human_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Limits for one budget tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Spend cap per job (None = uncapped)
    #[serde(default)]
    pub job_cap_usd: Option<f64>,

    /// Spend cap across all jobs of this tier (None = uncapped)
    #[serde(default)]
    pub tier_cap_usd: Option<f64>,

    /// Accumulated provider latency allowed per job
    #[serde(default, with = "human_duration_opt")]
    pub job_latency_budget: Option<Duration>,

    /// Ceiling for retry backoff
    #[serde(with = "human_duration")]
    pub max_backoff: Duration,

    /// Concurrent task attempts across all jobs of this tier
    pub worker_pool_size: usize,

    /// Whether tasks may fall back to the next cheaper tier
    #[serde(default)]
    pub allow_downgrade: bool,
}

/// Per-tier limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiersConfig {
    pub economy: TierConfig,
    pub standard: TierConfig,
    pub premium: TierConfig,
}

impl TiersConfig {
    pub fn get(&self, tier: BudgetTier) -> &TierConfig {
        match tier {
            BudgetTier::Economy => &self.economy,
            BudgetTier::Standard => &self.standard,
            BudgetTier::Premium => &self.premium,
        }
    }
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            economy: TierConfig {
                job_cap_usd: Some(0.50),
                tier_cap_usd: Some(25.0),
                job_latency_budget: None,
                max_backoff: Duration::from_secs(2),
                worker_pool_size: 2,
                allow_downgrade: false,
            },
            standard: TierConfig {
                job_cap_usd: Some(2.0),
                tier_cap_usd: Some(100.0),
                job_latency_budget: None,
                max_backoff: Duration::from_secs(10),
                worker_pool_size: 4,
                allow_downgrade: true,
            },
            premium: TierConfig {
                job_cap_usd: Some(10.0),
                tier_cap_usd: None,
                job_latency_budget: None,
                max_backoff: Duration::from_secs(30),
                worker_pool_size: 8,
                allow_downgrade: true,
            },
        }
    }
}

/// Tier circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Failure/overrun rate within `window` that opens the breaker
    pub failure_rate: f64,

    #[serde(with = "human_duration")]
    pub window: Duration,

    /// Samples required before the rate is considered
    pub min_samples: u32,

    /// Time spent open before probing
    #[serde(with = "human_duration")]
    pub cool_down: Duration,

    /// Concurrent probe admissions while half-open
    pub half_open_probes: u32,

    /// Probe successes needed to close
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate: 0.5,
            window: Duration::from_secs(60),
            min_samples: 10,
            cool_down: Duration::from_secs(30),
            half_open_probes: 1,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Try the next provider on a transient error instead of returning
    pub fallback_on_transient: bool,

    /// How long admission may wait for in-flight reservations to settle
    #[serde(with = "human_duration")]
    pub admission_wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fallback_on_transient: false,
            admission_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Attempts per task, including the first
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt up to the tier ceiling
    #[serde(with = "human_duration")]
    pub base_backoff: Duration,

    /// How long a cancelled job may take to settle
    #[serde(with = "human_duration")]
    pub cancel_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Pending writes held while the sink is slow or down
    pub buffer_capacity: usize,

    /// Retries per write before it is dropped
    pub retry_attempts: usize,

    #[serde(with = "human_duration")]
    pub retry_base: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            retry_attempts: 5,
            retry_base: Duration::from_millis(100),
        }
    }
}

/// Which tasks must succeed for a job to count as (partially) completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Applies to tasks that do not set `required`
    pub required_by_default: bool,

    /// Task types that are optional unless a task says otherwise
    pub optional_task_types: Vec<TaskType>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            required_by_default: true,
            optional_task_types: Vec::new(),
        }
    }
}

impl CompletionConfig {
    pub fn is_required(&self, spec: &TaskSpec) -> bool {
        spec.required.unwrap_or_else(|| {
            self.required_by_default && !self.optional_task_types.contains(&spec.task_type)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,

    #[serde(with = "human_duration")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tiers: TiersConfig,
    pub breaker: BreakerConfig,
    pub executor: ExecutorConfig,
    pub runner: RunnerConfig,
    pub persistence: PersistenceConfig,
    pub completion: CompletionConfig,

    /// Default rubric per task type; a task's own rubric wins
    pub rubrics: BTreeMap<TaskType, Rubric>,

    pub cache: CacheConfig,
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Apply `CONDUCTOR_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            self.runner.max_attempts = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_MAX_ATTEMPTS,
                value: value.clone(),
            })?;
        }

        if let Some(value) = lookup(ENV_PERSIST_BUFFER) {
            self.persistence.buffer_capacity =
                value.trim().parse().map_err(|_| ConfigError::Env {
                    var: ENV_PERSIST_BUFFER,
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup(ENV_ADMISSION_WAIT) {
            self.executor.admission_wait =
                humantime::parse_duration(value.trim()).map_err(|_| ConfigError::Env {
                    var: ENV_ADMISSION_WAIT,
                    value: value.clone(),
                })?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.runner.max_attempts == 0 {
            return invalid("runner.max_attempts must be at least 1".into());
        }
        if self.persistence.buffer_capacity == 0 {
            return invalid("persistence.buffer_capacity must be at least 1".into());
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be at least 1".into());
        }
        if self.breaker.half_open_probes == 0 {
            return invalid("breaker.half_open_probes must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.breaker.failure_rate) {
            return invalid("breaker.failure_rate must be within [0, 1]".into());
        }

        for tier in BudgetTier::ALL {
            let cfg = self.tiers.get(tier);
            if cfg.worker_pool_size == 0 {
                return invalid(format!("tiers.{}.worker_pool_size must be at least 1", tier));
            }
            for (name, cap) in [("job_cap_usd", cfg.job_cap_usd), ("tier_cap_usd", cfg.tier_cap_usd)] {
                if let Some(cap) = cap {
                    if !cap.is_finite() || cap <= 0.0 {
                        return invalid(format!("tiers.{}.{} must be positive", tier, name));
                    }
                }
            }
        }

        for (task_type, rubric) in &self.rubrics {
            rubric
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("rubrics.{}: {}", task_type, e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runner.max_attempts, 3);
        assert_eq!(config.tiers.get(BudgetTier::Economy).worker_pool_size, 2);
        assert!(!config.tiers.economy.allow_downgrade);
    }

    #[test]
    fn test_parse_yaml_with_human_durations() {
        let yaml = r#"
runner:
  max_attempts: 4
  base_backoff: 50ms
executor:
  admission_wait: 1s
tiers:
  economy: { job_cap_usd: 0.1, max_backoff: 500ms, worker_pool_size: 1 }
  standard: { job_cap_usd: 1.0, max_backoff: 5s, worker_pool_size: 2, allow_downgrade: true, job_latency_budget: 2m }
  premium: { max_backoff: 30s, worker_pool_size: 4, allow_downgrade: true }
completion:
  optional_task_types: [render]
rubrics:
  evidence:
    id: evidence-min
    pass_threshold: 0.5
    criteria:
      - type: min_evidence
        count: 3
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.runner.max_attempts, 4);
        assert_eq!(config.runner.base_backoff, Duration::from_millis(50));
        assert_eq!(config.runner.cancel_grace, Duration::from_secs(2));
        assert_eq!(config.executor.admission_wait, Duration::from_secs(1));
        assert_eq!(
            config.tiers.standard.job_latency_budget,
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.tiers.premium.job_cap_usd, None);
        assert!(config.rubrics.contains_key(&TaskType::Evidence));

        let render = TaskSpec::new("r", TaskType::Render);
        assert!(!config.completion.is_required(&render));
        let mut forced = render.clone();
        forced.required = Some(true);
        assert!(config.completion.is_required(&forced));
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::default()
            .with_overrides(|var| match var {
                ENV_MAX_ATTEMPTS => Some("5".into()),
                ENV_ADMISSION_WAIT => Some("250ms".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.runner.max_attempts, 5);
        assert_eq!(config.executor.admission_wait, Duration::from_millis(250));
        assert_eq!(config.persistence.buffer_capacity, 1024);
    }

    #[test]
    fn test_bad_override_rejected() {
        let err = RuntimeConfig::default()
            .with_overrides(|var| (var == ENV_PERSIST_BUFFER).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_PERSIST_BUFFER, .. }));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = RuntimeConfig::default();
        config.runner.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
