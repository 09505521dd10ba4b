//! Adaptive per-model rate limiter.
//!
//! Epistemic foundation:
//! - K_i: OpenAI-compatible servers may return x-ratelimit-* headers
//! - K_i: 429 responses require exponential backoff
//! - I^B: Exact limits unknowable until headers are received

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest backoff applied after repeated 429s.
const MAX_BACKOFF_SECS: f64 = 60.0;

/// Rate limit state for a single model.
#[derive(Debug, Default)]
struct ModelWindow {
    remaining_requests: Option<u32>,
    remaining_tokens: Option<u32>,
    reset_requests_at: Option<Instant>,
    reset_tokens_at: Option<Instant>,
    consecutive_429s: u32,
    backoff_until: Option<Instant>,
}

impl ModelWindow {
    /// Time to wait before the next request may be sent.
    fn wait_time(&self, now: Instant) -> Duration {
        let until = |t: Option<Instant>| t.filter(|&t| t > now).map(|t| t - now);

        let mut wait = until(self.backoff_until).unwrap_or_default();
        if self.remaining_requests == Some(0) {
            wait = wait.max(until(self.reset_requests_at).unwrap_or_default());
        }
        if self.remaining_tokens == Some(0) {
            wait = wait.max(until(self.reset_tokens_at).unwrap_or_default());
        }
        wait
    }

    fn record_429(&mut self, now: Instant) {
        self.consecutive_429s += 1;
        let backoff_secs = 2f64.powi(self.consecutive_429s as i32).min(MAX_BACKOFF_SECS);
        self.backoff_until = Some(now + Duration::from_secs_f64(backoff_secs));
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs = backoff_secs,
            "Rate limited (429), backing off"
        );
    }

    fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.backoff_until = None;
    }

    fn update_from_headers(&mut self, headers: &HeaderMap, now: Instant) {
        let header = |key: &str| headers.get(key).and_then(|v| v.to_str().ok());
        let reset = |key: &str| {
            header(key)
                .and_then(|s| s.trim_end_matches('s').parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| now + Duration::from_secs_f64(secs))
        };

        if let Some(v) = header("x-ratelimit-remaining-requests") {
            self.remaining_requests = v.parse().ok();
        }
        if let Some(v) = header("x-ratelimit-remaining-tokens") {
            self.remaining_tokens = v.parse().ok();
        }
        if let Some(at) = reset("x-ratelimit-reset-requests") {
            self.reset_requests_at = Some(at);
        }
        if let Some(at) = reset("x-ratelimit-reset-tokens") {
            self.reset_tokens_at = Some(at);
        }
    }
}

/// Adaptive rate limiter shared by all calls to one endpoint.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, ModelWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait if necessary before making a request to the given model.
    ///
    /// Returns the duration waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let wait = self
            .windows
            .get(model)
            .map(|w| w.wait_time(Instant::now()))
            .unwrap_or_default();

        if !wait.is_zero() {
            debug!(model = model, wait_ms = wait.as_millis(), "Waiting for rate limit");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a response status and its headers.
    pub fn record_request(&self, model: &str, status: u16, headers: &HeaderMap) {
        let now = Instant::now();
        let mut window = self.windows.entry(model.to_string()).or_default();
        window.update_from_headers(headers, now);

        if status == 429 {
            window.record_429(now);
        } else if status < 400 {
            window.record_success();
        }
    }

    /// Current wait for a model without sleeping.
    pub fn pending_wait(&self, model: &str) -> Duration {
        self.windows
            .get(model)
            .map(|w| w.wait_time(Instant::now()))
            .unwrap_or_default()
    }
}
