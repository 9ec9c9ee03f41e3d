//! OpenAI-compatible chat completions over HTTP.
//!
//! Works with any endpoint speaking the `/chat/completions` dialect. If the
//! model answers with a JSON object `{"content": ..., "evidence": [...]}`,
//! the evidence is lifted into the response; otherwise the whole reply is
//! the content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor_core::EvidenceItem;

use super::{
    factory::ProviderFactory,
    pricing_for,
    secrets::{ApiCredential, CredentialSource},
    InvokeRequest, ProviderAdapter, ProviderError, ProviderResponse, TokenUsage,
};

pub const API_KEY_ENV: &str = "CONDUCTOR_PROVIDER_API_KEY";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct HttpChatAdapter {
    name: String,
    credential: ApiCredential,
    base_url: String,
    system_prompt: Option<String>,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpChatAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatAdapter")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpChatAdapter {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::build(
            name.into(),
            ApiCredential::new(api_key, CredentialSource::Programmatic, "provider API key"),
            DEFAULT_BASE_URL.to_string(),
        )
    }

    /// `api_key` from config or `CONDUCTOR_PROVIDER_API_KEY`; optional
    /// `name`, `base_url`, `system_prompt`, `max_tokens`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let credential =
            ApiCredential::from_config_or_env(config, "api_key", API_KEY_ENV, "provider API key")?;
        let base_url = config["base_url"]
            .as_str()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let name = config["name"].as_str().unwrap_or("openai-compatible").to_string();

        let mut adapter = Self::build(name, credential, base_url)?;
        adapter.system_prompt = config["system_prompt"].as_str().map(str::to_string);
        if let Some(max_tokens) = config["max_tokens"].as_u64() {
            adapter.max_tokens = max_tokens as u32;
        }
        Ok(adapter)
    }

    fn build(
        name: String,
        credential: ApiCredential,
        base_url: String,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;
        Ok(Self {
            name,
            credential,
            base_url,
            system_prompt: None,
            max_tokens: super::DEFAULT_COMPLETION_TOKENS,
            client,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    content: String,
    #[serde(default)]
    evidence: Vec<EvidenceItem>,
}

fn split_envelope(raw: String) -> (String, Vec<EvidenceItem>) {
    match serde_json::from_str::<Envelope>(&raw) {
        Ok(envelope) => (envelope.content, envelope.evidence),
        Err(_) => (raw, Vec::new()),
    }
}

#[async_trait]
impl ProviderAdapter for HttpChatAdapter {
    async fn invoke(&self, request: &InvokeRequest) -> Result<ProviderResponse, ProviderError> {
        let user = match &request.input {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user,
        });

        let body = ChatRequest {
            model: &request.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(request.timeout)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Auth);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let raw = body
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Parse("no content in response".into()))?;
        let (content, evidence) = split_envelope(raw);

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            content,
            evidence,
            cost_usd: pricing_for(&body.model).cost(&usage),
            latency_ms,
            model: body.model,
            usage,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }
}

/// Builds [`HttpChatAdapter`]s.
///
/// ```json
/// { "api_key": "sk-...", "base_url": "https://...", "name": "openai", "max_tokens": 800 }
/// ```
pub struct HttpChatAdapterFactory;

impl ProviderFactory for HttpChatAdapterFactory {
    fn provider_type(&self) -> &'static str {
        "openai-compatible"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.validate_config(config)?;
        Ok(Arc::new(HttpChatAdapter::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(config, "api_key", API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "API key required: set 'api_key' in config or {}",
                API_KEY_ENV
            )));
        }
        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": DEFAULT_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible chat completions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_lifts_evidence() {
        let raw = r#"{"content": "Findings", "evidence": [{"kind": "survey", "strength": "strong", "quality": 0.8}]}"#;
        let (content, evidence) = split_envelope(raw.to_string());
        assert_eq!(content, "Findings");
        assert_eq!(evidence.len(), 1);

        let (content, evidence) = split_envelope("plain text".to_string());
        assert_eq!(content, "plain text");
        assert!(evidence.is_empty());
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        let config = serde_json::json!({"api_key": "k", "base_url": "ftp://x"});
        assert!(HttpChatAdapterFactory.validate_config(&config).is_err());
        let config = serde_json::json!({"api_key": "k", "base_url": "https://x"});
        assert!(HttpChatAdapterFactory.validate_config(&config).is_ok());
    }

    #[test]
    fn test_debug_hides_key() {
        let adapter = HttpChatAdapter::new("openai", "sk-secret").unwrap();
        assert!(!format!("{:?}", adapter).contains("sk-secret"));
    }
}
