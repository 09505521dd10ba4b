//! Scripted model adapters for tests.

use crate::client::{Completion, Message, ModelAdapter};
use crate::models::{Result, TierError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Responder = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Adapter answering from a script, then from a fallback function.
pub struct MockAdapter {
    name: String,
    script: Mutex<VecDeque<Result<String>>>,
    fallback: Responder,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    transcripts: Mutex<Vec<Vec<Message>>>,
}

impl MockAdapter {
    /// Always answers with `text`.
    pub fn fixed(name: &str, text: &str) -> Self {
        let text = text.to_string();
        Self::with_fn(name, move |_| Ok(text.clone()))
    }

    /// Answers by applying `f` to the prompt.
    pub fn with_fn(
        name: &str,
        f: impl Fn(&str) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(f),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            transcripts: Mutex::new(Vec::new()),
        }
    }

    /// Always fails.
    pub fn failing(name: &str) -> Self {
        Self::with_fn(name, |_| Err(TierError::Internal("scripted failure".to_string())))
    }

    /// Queue responses consumed before the fallback applies.
    pub fn then(self, response: Result<String>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn transcripts(&self) -> Vec<Vec<Message>> {
        self.transcripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        prompt: &str,
        transcript: &[Message],
        _timeout: Duration,
    ) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.transcripts.lock().unwrap().push(transcript.to_vec());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let text = match scripted {
            Some(response) => response?,
            None => (self.fallback)(prompt)?,
        };

        Ok(Completion {
            text,
            latency: Duration::from_millis(5),
            raw: serde_json::json!({ "mock": self.name }),
        })
    }
}
