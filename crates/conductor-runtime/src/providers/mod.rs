//! Provider adapters: the only place outbound model calls are made.
//!
//! The executor talks to providers through [`ProviderAdapter`]; concrete
//! adapters are registered by name in a [`ProviderRegistry`], either
//! directly or through a [`ProviderFactory`].
//!
//! ## Security
//!
//! Adapters hold credentials as [`ApiCredential`], which never prints its
//! value. See the [`secrets`] module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use conductor_core::{ContextPolicy, EvidenceItem, FailureKind, TaskType};

mod factory;
pub mod secrets;

#[cfg(feature = "http")]
mod http;

pub use factory::{ProviderFactory, ProviderRegistry};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "http")]
pub use http::{HttpChatAdapter, HttpChatAdapterFactory};

/// Completion tokens assumed when estimating a call up front.
pub const DEFAULT_COMPLETION_TOKENS: u32 = 512;

/// Errors from provider calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("authentication failed")]
    Auth,

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Network(_)
            | ProviderError::Parse(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Rejected(_) | ProviderError::Auth | ProviderError::NotConfigured(_) => {
                false
            }
        }
    }

    /// Task failure this error maps to.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProviderError::Timeout(_) => FailureKind::Timeout,
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
            ProviderError::Network(_) | ProviderError::Parse(_) => FailureKind::Network,
            ProviderError::Api { status, .. } if *status >= 500 => FailureKind::Network,
            ProviderError::Api { .. }
            | ProviderError::Rejected(_)
            | ProviderError::Auth
            | ProviderError::NotConfigured(_) => FailureKind::ProviderRejected,
        }
    }
}

/// One call to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub job_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub task_type: TaskType,
    pub model: String,
    pub input: serde_json::Value,
    /// Route ceiling for this call
    pub max_cost_usd: f64,
    pub timeout: Duration,
    pub context_policy: ContextPolicy,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// What a provider returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Projected cost and latency of a call, used for admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

/// List price for a model, by family name.
pub fn pricing_for(model: &str) -> Pricing {
    let (input, output) = match model {
        m if m.contains("haiku") => (1.0, 5.0),
        m if m.contains("opus") => (5.0, 25.0),
        m if m.contains("sonnet") => (3.0, 15.0),
        m if m.contains("gpt-4o-mini") => (0.15, 0.6),
        m if m.contains("gpt-4o") => (2.5, 10.0),
        m if m.starts_with("local") => (0.0, 0.0),
        _ => (3.0, 15.0),
    };
    Pricing {
        input_per_million: input,
        output_per_million: output,
    }
}

/// A model provider the executor can call.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Perform the call. Must not retry internally.
    async fn invoke(&self, request: &InvokeRequest) -> Result<ProviderResponse, ProviderError>;

    /// Projected cost and latency of `request`.
    fn estimate(&self, request: &InvokeRequest) -> CostEstimate {
        let prompt_tokens = (request.input.to_string().len() / 4) as u32;
        let usage = TokenUsage {
            prompt_tokens,
            completion_tokens: DEFAULT_COMPLETION_TOKENS,
        };
        CostEstimate {
            cost_usd: pricing_for(&request.model).cost(&usage),
            latency_ms: 0,
        }
    }

    fn name(&self) -> &str;

    async fn health_check(&self) -> bool {
        true
    }
}
