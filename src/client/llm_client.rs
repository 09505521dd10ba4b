//! Generic LLM client for OpenAI-compatible endpoints.
//!
//! Epistemic foundation:
//! - K_i: OpenAI API schema is the de facto standard
//! - K_i: Hosted APIs and on-prem servers (vLLM, Ollama) all support it
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Network availability unknowable → retry with backoff

use crate::client::RateLimiter;
use crate::models::{ApiError, ModelSpec, Result, TierError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content (empty if the endpoint returned none)
    pub content: String,
    /// Model that served the request (may differ from requested)
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Wall time across all HTTP attempts
    pub duration: Duration,
}

/// Exponential wait between attempts after network errors and 5xx.
fn transient_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6))
}

/// Wait before the next HTTP attempt, or `None` when `error` is final.
///
/// A `retry-after` hint wins over the exponential schedule.
fn retry_wait(error: &TierError, attempt: u32) -> Option<Duration> {
    if !error.is_retryable() {
        return None;
    }
    Some(
        error
            .retry_after()
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| transient_backoff(attempt)),
    )
}

/// Pull the human-readable message out of an error body, if it has one.
fn error_message(body: String) -> String {
    match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body,
    }
}

/// Build the request headers once; bad custom headers are skipped with a warning.
fn build_headers(
    endpoint: &str,
    api_key: Option<&str>,
    custom: &HashMap<String, String>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("X-Title", HeaderValue::from_static("tierqa"));

    if let Some(value) = api_key.and_then(|k| HeaderValue::from_str(&format!("Bearer {k}")).ok()) {
        headers.insert(AUTHORIZATION, value);
    }

    for (key, value) in custom {
        match (
            HeaderName::try_from(key.as_str()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(endpoint, header = %key, "Skipping invalid custom header"),
        }
    }

    headers
}

/// Chat-completions client for one OpenAI-compatible endpoint.
///
/// HTTP-level retries cover 429s (honouring `retry-after`), network errors
/// and 5xx. 4xx other than 429 fail immediately.
pub struct LLMClient {
    client: reqwest::Client,
    /// Endpoint name (for logging)
    name: String,
    base_url: String,
    headers: HeaderMap,
    /// Fallback when a caller passes a zero timeout
    timeout: Duration,
    /// Attempts per call at the HTTP layer (at least one)
    attempts: u32,
    rate_limiter: Arc<RateLimiter>,
}

impl LLMClient {
    /// Create a client for endpoint `name`.
    ///
    /// `api_key` is omitted for local servers without auth. Header values
    /// are expected to be env-expanded already.
    pub fn new(
        name: String,
        api_key: Option<String>,
        base_url: String,
        custom_headers: HashMap<String, String>,
        timeout_secs: u64,
        max_retries: u32,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TierError::Network)?;
        let headers = build_headers(&name, api_key.as_deref(), &custom_headers);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            name,
            timeout,
            attempts: max_retries.max(1),
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a chat completion for `model`.
    ///
    /// B_i(endpoint answers with a valid body) → Result
    /// I^B(rate limits, transient faults) → bounded HTTP retries
    pub async fn complete(
        &self,
        model: &ModelSpec,
        messages: Vec<Message>,
        temperature: Option<f64>,
        timeout: Duration,
    ) -> Result<CompletionResponse> {
        let start = Instant::now();
        let timeout = if timeout.is_zero() { self.timeout } else { timeout };
        let request = ChatCompletionRequest {
            model: model.id.clone(),
            messages,
            max_tokens: model.max_tokens,
            temperature: temperature.unwrap_or(0.0),
        };

        let mut last_error = None;
        for attempt in 0..self.attempts {
            let error = match self.send(model, &request, timeout).await {
                Ok(mut response) => {
                    response.duration = start.elapsed();
                    return Ok(response);
                }
                Err(e) => e,
            };
            let Some(wait) = retry_wait(&error, attempt) else {
                return Err(error);
            };
            if attempt + 1 < self.attempts {
                debug!(
                    endpoint = %self.name,
                    model = %model.id,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "Retrying request"
                );
                tokio::time::sleep(wait).await;
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| {
            TierError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.attempts,
                last_error: "no attempt made".to_string(),
            })
        }))
    }

    /// One HTTP round trip.
    async fn send(
        &self,
        model: &ModelSpec,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<CompletionResponse> {
        self.rate_limiter.wait_if_needed(&model.id).await;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TierError::Timeout(timeout)
                } else {
                    TierError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        self.rate_limiter
            .record_request(&model.id, status, response.headers());

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s >= 0.0)
                .unwrap_or(1.0);
            return Err(TierError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            let message = error_message(response.text().await.unwrap_or_default());
            return Err(TierError::Api(match status {
                401 | 403 => ApiError::AuthenticationFailed(self.name.clone()),
                404 => ApiError::ModelNotFound(model.id.clone()),
                _ => ApiError::Status { status, message },
            }));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            TierError::ParseError(format!("Malformed completion body from '{}': {e}", self.name))
        })?;

        let usage = body.usage.unwrap_or_default();
        let choice = body.choices.into_iter().next().ok_or_else(|| {
            TierError::Api(ApiError::InvalidResponse("No choices in response".to_string()))
        })?;
        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: body.model.unwrap_or_else(|| model.id.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            duration: Duration::ZERO,
        })
    }

    /// Probe `GET /models`; any 2xx counts as healthy.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .headers(self.headers.clone())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;

        let (status, latency_ms, error) = match probe {
            Ok(response) if response.status().is_success() => {
                (HealthStatus::Healthy, Some(start.elapsed().as_millis() as u64), None)
            }
            Ok(response) => (
                HealthStatus::Unhealthy,
                Some(start.elapsed().as_millis() as u64),
                Some(format!("HTTP {}", response.status().as_u16())),
            ),
            Err(e) => (HealthStatus::Unreachable, None, Some(e.to_string())),
        };

        HealthCheckResult {
            endpoint: self.name.clone(),
            status,
            latency_ms,
            error,
        }
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
