//! Model adapter seam.
//!
//! Epistemic foundation:
//! - K_i: The pipeline only needs text in, text out, with timing
//! - B_i: Any invocation may fail or hang → Result + caller-side timeout
//! - I^R: Which concrete endpoint backs a candidate is configurable

use crate::client::{LLMClient, Message};
use crate::models::{ModelSpec, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Output of one model invocation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text
    pub text: String,
    /// Wall-clock time of the call
    pub latency: Duration,
    /// Request/response transcript for the audit log
    pub raw: serde_json::Value,
}

/// A candidate or judge model.
///
/// `transcript` holds the messages preceding `prompt` (system prompt,
/// earlier turns); `prompt` is sent as the final user message.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Name used in logs and audit records.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        prompt: &str,
        transcript: &[Message],
        timeout: Duration,
    ) -> Result<Completion>;
}

/// A configured candidate: its result key, switch, and adapter.
///
/// Disabled candidates carry no adapter and are never invoked.
#[derive(Clone)]
pub struct CandidateSlot {
    pub name: String,
    pub enabled: bool,
    pub adapter: Option<Arc<dyn ModelAdapter>>,
}

impl CandidateSlot {
    pub fn enabled(name: impl Into<String>, adapter: Arc<dyn ModelAdapter>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            adapter: Some(adapter),
        }
    }

    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            adapter: None,
        }
    }
}

/// Adapter for a model served by an OpenAI-compatible endpoint.
pub struct EndpointAdapter {
    name: String,
    client: Arc<LLMClient>,
    model: ModelSpec,
    temperature: f64,
}

impl EndpointAdapter {
    pub fn new(
        name: impl Into<String>,
        client: Arc<LLMClient>,
        model: ModelSpec,
        default_temperature: f64,
    ) -> Self {
        let temperature = model.temperature.unwrap_or(default_temperature);
        Self {
            name: name.into(),
            client,
            model,
            temperature,
        }
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }
}

#[async_trait]
impl ModelAdapter for EndpointAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        prompt: &str,
        transcript: &[Message],
        timeout: Duration,
    ) -> Result<Completion> {
        let mut messages = transcript.to_vec();
        messages.push(Message::user(prompt));

        let response = self
            .client
            .complete(&self.model, messages.clone(), Some(self.temperature), timeout)
            .await?;

        let raw = serde_json::json!({
            "endpoint": self.client.name(),
            "model": response.model,
            "messages": messages,
            "content": response.content,
            "input_tokens": response.input_tokens,
            "output_tokens": response.output_tokens,
        });

        Ok(Completion {
            text: response.content,
            latency: response.duration,
            raw,
        })
    }
}
