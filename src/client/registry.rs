//! Endpoint registry: builds clients and model adapters from configuration.
//!
//! Epistemic foundation:
//! - K_i: All endpoints are OpenAI-compatible
//! - B_i: Endpoints are reachable (verified via health checks)
//! - I^R: User configures which candidates run and which model judges

use crate::client::{
    CandidateSlot, EndpointAdapter, HealthCheckResult, HealthStatus, LLMClient, ModelAdapter,
    RateLimiter,
};
use crate::models::{
    Config, ConfigError, DEFAULT_CANDIDATE_TEMPERATURE, DEFAULT_JUDGE_TEMPERATURE, ModelSpec,
    expand_headers,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of configured LLM endpoints.
///
/// Only endpoints referenced by an enabled candidate or the judge are
/// built, so disabled candidates never require credentials.
pub struct EndpointRegistry {
    endpoints: HashMap<String, Arc<LLMClient>>,
}

impl EndpointRegistry {
    /// Build registry from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingApiKey` if an endpoint requires an API key
    /// but none is configured or found in environment variables.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut endpoints = HashMap::new();

        for name in config.referenced_endpoints() {
            let endpoint_config = config
                .endpoints
                .get(&name)
                .ok_or_else(|| ConfigError::EndpointNotFound(name.clone()))?;
            let api_key = config.resolve_endpoint_api_key(&name)?;

            let client = LLMClient::new(
                name.clone(),
                api_key,
                endpoint_config.base_url.clone(),
                expand_headers(&endpoint_config.headers),
                endpoint_config.timeout_secs,
                endpoint_config.max_retries,
                Some(Arc::new(RateLimiter::new())),
            )
            .map_err(|e| ConfigError::Invalid(format!("Failed to create '{name}' client: {e}")))?;

            endpoints.insert(name, Arc::new(client));
        }

        Ok(Self { endpoints })
    }

    /// Get client by endpoint name.
    pub fn get(&self, name: &str) -> Option<&Arc<LLMClient>> {
        self.endpoints.get(name)
    }

    /// Get all endpoint names.
    pub fn endpoint_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn adapter(
        &self,
        name: &str,
        model: &ModelSpec,
        default_temperature: f64,
    ) -> Result<Arc<dyn ModelAdapter>, ConfigError> {
        let client = self
            .get(&model.endpoint)
            .ok_or_else(|| ConfigError::EndpointNotFound(model.endpoint.clone()))?;
        Ok(Arc::new(EndpointAdapter::new(
            name,
            Arc::clone(client),
            model.clone(),
            default_temperature,
        )))
    }

    /// Candidate slots in configuration order.
    pub fn candidate_slots(&self, config: &Config) -> Result<Vec<CandidateSlot>, ConfigError> {
        config
            .candidates
            .iter()
            .map(|c| {
                if c.enabled {
                    let adapter =
                        self.adapter(&c.name, &c.model, DEFAULT_CANDIDATE_TEMPERATURE)?;
                    Ok(CandidateSlot::enabled(c.name.clone(), adapter))
                } else {
                    Ok(CandidateSlot::disabled(c.name.clone()))
                }
            })
            .collect()
    }

    /// Adapter for the judge model (deterministic by default).
    pub fn judge_adapter(&self, config: &Config) -> Result<Arc<dyn ModelAdapter>, ConfigError> {
        self.adapter("judge", &config.judge, DEFAULT_JUDGE_TEMPERATURE)
    }

    /// Run health checks on all endpoints concurrently.
    pub async fn health_check_all(&self) -> Vec<HealthCheckResult> {
        let mut handles = Vec::with_capacity(self.endpoints.len());

        for client in self.endpoints.values() {
            let client = Arc::clone(client);
            handles.push(tokio::spawn(async move { client.health_check().await }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    match result.status {
                        HealthStatus::Healthy => info!(
                            endpoint = %result.endpoint,
                            latency_ms = result.latency_ms.unwrap_or(0),
                            "Endpoint healthy"
                        ),
                        _ => warn!(
                            endpoint = %result.endpoint,
                            status = %result.status,
                            error = result.error.as_deref().unwrap_or(""),
                            "Endpoint unhealthy"
                        ),
                    }
                    results.push(result);
                }
                Err(e) => warn!(error = %e, "Health check task panicked"),
            }
        }

        results.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[endpoints.local]
base_url = "http://localhost:11434/v1"

[endpoints.cloud]
base_url = "https://api.example.com/v1"
api_key_env = "TIERQA_TEST_UNSET_KEY"

[[candidates]]
name = "model1"
endpoint = "local"
id = "qwen2.5:72b"

[[candidates]]
name = "model2"
endpoint = "cloud"
id = "big-model"
enabled = false

[judge]
endpoint = "local"
id = "judge"
"#;

    #[test]
    fn test_disabled_candidate_needs_no_credentials() {
        let config = Config::from_toml_str(CONFIG).unwrap();
        let registry = EndpointRegistry::from_config(&config).unwrap();
        assert_eq!(registry.endpoint_names(), vec!["local"]);

        let slots = registry.candidate_slots(&config).unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots[0].enabled && slots[0].adapter.is_some());
        assert!(!slots[1].enabled && slots[1].adapter.is_none());

        let judge = registry.judge_adapter(&config).unwrap();
        assert_eq!(judge.name(), "judge");
    }

    #[test]
    fn test_missing_key_for_enabled_candidate() {
        let text = CONFIG.replace("enabled = false", "enabled = true");
        let config = Config::from_toml_str(&text).unwrap();
        let err = EndpointRegistry::from_config(&config).err().unwrap();
        assert!(matches!(err, ConfigError::MissingApiKey { .. }));
    }
}
