//! The process-wide LLM instance cache, keyed by model-configuration name.
//! Admin mutations to a model config invalidate its entry so the next turn
//! rebuilds the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use dg_domain::error::Result;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Connection parameters of one admin-managed model configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEndpoint {
    /// Configuration name; the registry cache key.
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    /// Provider-side model identifier (e.g. "gpt-4.1").
    pub model_id: String,
}

pub struct ProviderRegistry {
    clients: RwLock<HashMap<String, (ModelEndpoint, Arc<dyn LlmProvider>)>>,
    request_timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            request_timeout,
        }
    }

    /// The cached client for this endpoint, built on first use. A changed
    /// endpoint under the same name replaces the cached instance.
    pub fn get_or_create(&self, endpoint: &ModelEndpoint) -> Result<Arc<dyn LlmProvider>> {
        {
            let clients = self.clients.read();
            if let Some((cached_endpoint, client)) = clients.get(&endpoint.name) {
                if cached_endpoint == endpoint {
                    return Ok(client.clone());
                }
            }
        }

        let client: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatProvider::new(
            endpoint.name.clone(),
            &endpoint.base_url,
            endpoint.api_key.clone(),
            endpoint.model_id.clone(),
            self.request_timeout,
        )?);
        self.clients
            .write()
            .insert(endpoint.name.clone(), (endpoint.clone(), client.clone()));
        tracing::debug!(model_config = %endpoint.name, "LLM client built");
        Ok(client)
    }

    /// Drop the cached client for one configuration name.
    pub fn invalidate(&self, name: &str) {
        self.clients.write().remove(name);
    }

    pub fn clear(&self) {
        self.clients.write().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.clients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, model: &str) -> ModelEndpoint {
        ModelEndpoint {
            name: name.into(),
            base_url: "https://api.example.com/v1".into(),
            api_key: "key".into(),
            model_id: model.into(),
        }
    }

    #[test]
    fn caches_by_configuration_name() {
        let registry = ProviderRegistry::new(Duration::from_secs(30));
        let a = registry.get_or_create(&endpoint("main", "gpt-4.1")).unwrap();
        let b = registry.get_or_create(&endpoint("main", "gpt-4.1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.cached_count(), 1);
    }

    #[test]
    fn changed_endpoint_rebuilds_client() {
        let registry = ProviderRegistry::new(Duration::from_secs(30));
        let a = registry.get_or_create(&endpoint("main", "gpt-4.1")).unwrap();
        let b = registry.get_or_create(&endpoint("main", "gpt-4.1-mini")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.cached_count(), 1);
    }

    #[test]
    fn invalidate_drops_entry() {
        let registry = ProviderRegistry::new(Duration::from_secs(30));
        registry.get_or_create(&endpoint("main", "gpt-4.1")).unwrap();
        registry.invalidate("main");
        assert_eq!(registry.cached_count(), 0);
    }
}
