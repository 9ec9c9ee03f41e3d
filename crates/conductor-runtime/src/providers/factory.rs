//! Provider registration.
//!
//! Adapters are looked up by the names that appear in a route's
//! `provider_order`. Names are case-insensitive.
//!
//! ```ignore
//! let mut registry = ProviderRegistry::new();
//! registry.register_factory(Arc::new(HttpChatAdapterFactory));
//! registry.instantiate("openai", "openai-compatible", &config)?;
//! ```

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{ProviderAdapter, ProviderError};

/// Builds adapters of one kind from JSON configuration.
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier of the adapter kind, e.g. "openai-compatible".
    fn provider_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;

    /// Check configuration without building an adapter.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "Model provider"
    }
}

/// Named adapters plus the factories that can build more.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; replaces one of the same type.
    pub fn register_factory(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Build an adapter of `provider_type` without registering it.
    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.factories
            .get(provider_type)
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "unknown provider type '{}', available: {:?}",
                    provider_type,
                    self.available_types()
                ))
            })?
            .create(config)
    }

    /// Build an adapter and register it under `name`.
    pub fn instantiate(
        &mut self,
        name: &str,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<(), ProviderError> {
        let adapter = self.create(provider_type, config)?;
        self.insert(name, adapter);
        Ok(())
    }

    /// Register a ready adapter under `name`.
    pub fn insert(&mut self, name: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(name.to_ascii_lowercase(), adapter);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: &str, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.insert(name, adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered adapter names.
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Health of every registered adapter, checked concurrently.
    pub async fn health_report(&self) -> BTreeMap<String, bool> {
        let checks = self.adapters.iter().map(|(name, adapter)| async move {
            (name.clone(), adapter.health_check().await)
        });
        join_all(checks).await.into_iter().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("adapters", &self.names())
            .field("factories", &self.available_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{InvokeRequest, ProviderResponse, TokenUsage};
    use async_trait::async_trait;

    struct StaticAdapter {
        name: String,
        healthy: bool,
    }

    #[async_trait]
    impl ProviderAdapter for StaticAdapter {
        async fn invoke(&self, request: &InvokeRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                content: "ok".into(),
                evidence: Vec::new(),
                cost_usd: 0.0,
                latency_ms: 1,
                model: request.model.clone(),
                usage: TokenUsage::default(),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn health_check(&self) -> bool {
            self.healthy
        }
    }

    struct StaticFactory;

    impl ProviderFactory for StaticFactory {
        fn provider_type(&self) -> &'static str {
            "static"
        }

        fn create(&self, config: &JsonValue) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
            self.validate_config(config)?;
            Ok(Arc::new(StaticAdapter {
                name: config["name"].as_str().unwrap_or("static").to_string(),
                healthy: config["healthy"].as_bool().unwrap_or(true),
            }))
        }

        fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
            if config.get("broken").is_some() {
                return Err(ProviderError::NotConfigured("broken".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_instantiate_and_lookup_case_insensitive() {
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Arc::new(StaticFactory));
        registry
            .instantiate("Local", "static", &serde_json::json!({"name": "local"}))
            .unwrap();

        assert!(registry.contains("local"));
        assert_eq!(registry.get("LOCAL").unwrap().name(), "local");
        assert_eq!(registry.names(), vec!["local"]);
    }

    #[test]
    fn test_unknown_type_lists_available() {
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Arc::new(StaticFactory));
        match registry.create("other", &serde_json::json!({})) {
            Err(ProviderError::NotConfigured(msg)) => assert!(msg.contains("static")),
            _ => panic!("expected NotConfigured"),
        }
    }

    #[test]
    fn test_factory_validation_propagates() {
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Arc::new(StaticFactory));
        let result = registry.instantiate("x", "static", &serde_json::json!({"broken": true}));
        assert!(result.is_err());
        assert!(!registry.contains("x"));
    }

    #[tokio::test]
    async fn test_health_report() {
        let registry = ProviderRegistry::new()
            .with("up", Arc::new(StaticAdapter { name: "up".into(), healthy: true }))
            .with("down", Arc::new(StaticAdapter { name: "down".into(), healthy: false }));
        let report = registry.health_report().await;
        assert_eq!(report.get("up"), Some(&true));
        assert_eq!(report.get("down"), Some(&false));
    }
}
