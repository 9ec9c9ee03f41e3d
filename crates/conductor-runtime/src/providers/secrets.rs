//! Provider credentials.
//!
//! [`ApiCredential`] wraps the value in a [`SecretString`]: `Debug` and
//! `Display` print `[REDACTED]`, and the value is only reachable through
//! [`ApiCredential::expose`], which adapters call when building a request.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => f.write_str("config"),
            CredentialSource::Environment => f.write_str("environment"),
            CredentialSource::Programmatic => f.write_str("programmatic"),
        }
    }
}

pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    /// `config[config_key]` if present, else the `env_var` environment variable.
    pub fn from_config_or_env(
        config: &JsonValue,
        config_key: &str,
        env_var: &str,
        name: &'static str,
    ) -> Result<Self, ProviderError> {
        Self::from_lookup(config, config_key, env_var, name, |var| std::env::var(var).ok())
    }

    fn from_lookup<F>(
        config: &JsonValue,
        config_key: &str,
        env_var: &str,
        name: &'static str,
        lookup: F,
    ) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = config.get(config_key).and_then(JsonValue::as_str) {
            return Ok(Self::new(value, CredentialSource::Config, name));
        }
        if let Some(value) = lookup(env_var) {
            return Ok(Self::new(value, CredentialSource::Environment, name));
        }
        Err(ProviderError::NotConfigured(format!(
            "{} required: set '{}' in config or the {} environment variable",
            name, config_key, env_var
        )))
    }

    pub fn is_available(config: &JsonValue, config_key: &str, env_var: &str) -> bool {
        config.get(config_key).and_then(JsonValue::as_str).is_some()
            || std::env::var(env_var).is_ok()
    }

    /// The raw value. Call at the point of use; never store the result.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}
