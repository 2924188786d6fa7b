//! Provider registry
//!
//! Process-wide name → provider lookup, built from configuration at startup
//! and rebuilt on config reload.

use crate::cli::{CliProvider, CliProviderConfig};
use crate::error::{Error, Result};
use crate::http::{HttpProvider, HttpProviderConfig};
use crate::provider::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Declarative provider specification from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSpec {
    /// Subprocess provider
    Cli(CliProviderConfig),
    /// OpenAI-compatible HTTP provider
    Http(HttpProviderConfig),
}

impl ProviderSpec {
    /// The provider name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Cli(c) => &c.name,
            Self::Http(c) => &c.name,
        }
    }
}

/// Registry of named providers
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from provider specs
    ///
    /// # Errors
    /// Returns an error if any provider fails to construct.
    pub fn from_specs(specs: &[ProviderSpec]) -> Result<Self> {
        let registry = Self::new();
        registry.rebuild(specs)?;
        Ok(registry)
    }

    /// Replace the registered providers from fresh specs
    ///
    /// # Errors
    /// Returns an error if any provider fails to construct; the previous
    /// set stays in place on failure.
    pub fn rebuild(&self, specs: &[ProviderSpec]) -> Result<()> {
        let mut next: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for spec in specs {
            let provider: Arc<dyn Provider> = match spec {
                ProviderSpec::Cli(config) => Arc::new(CliProvider::new(config.clone())),
                ProviderSpec::Http(config) => Arc::new(HttpProvider::new(config.clone())?),
            };
            debug!(provider = %spec.name(), "registering provider");
            next.insert(spec.name().to_string(), provider);
        }

        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        *providers = next;
        info!(count = providers.len(), "provider registry built");
        Ok(())
    }

    /// Register a provider instance directly
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider by name
    ///
    /// # Errors
    /// Returns `NotConfigured` when the name is unknown.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotConfigured(name.to_string()))
    }

    /// Registered provider names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers.keys().cloned().collect()
    }

    /// Whether a named provider threads conversation state itself
    #[must_use]
    pub fn has_native_session(&self, name: &str) -> bool {
        self.get(name)
            .map(|p| p.has_native_session())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;

    #[test]
    fn test_registry_from_specs() {
        let specs = vec![
            ProviderSpec::Cli(CliProviderConfig::claude()),
            ProviderSpec::Http(HttpProviderConfig {
                name: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: "test".to_string(),
                default_model: "gpt-4o-mini".to_string(),
                pricing: HashMap::new(),
            }),
        ];

        let registry = ProviderRegistry::from_specs(&specs).unwrap();
        assert!(registry.get("claude").is_ok());
        assert!(registry.get("openai").is_ok());
        assert!(registry.get("missing").is_err());
        assert!(registry.has_native_session("claude"));
        assert!(!registry.has_native_session("openai"));
    }

    #[test]
    fn test_register_direct() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::new("mock")));
        assert_eq!(registry.get("mock").unwrap().name(), "mock");
    }

    #[test]
    fn test_rebuild_replaces() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::new("old")));

        let specs = vec![ProviderSpec::Cli(CliProviderConfig::new("new", "echo"))];
        registry.rebuild(&specs).unwrap();

        assert!(registry.get("old").is_err());
        assert!(registry.get("new").is_ok());
    }
}
