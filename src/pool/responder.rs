//! Responder pool: fans an item out to the candidate models.
//!
//! Epistemic foundation:
//! - K_i: Disabled candidates are never invoked
//! - K_i: Known results are reused verbatim, never re-invoked
//! - K_i: Rounds of a multi-round item run strictly in order per candidate
//! - B_i: Each call may time out, fail, or return nothing usable → bounded retries
//! - I^B: Retry backoff races the shutdown token

use crate::checkpoint::AuditEvent;
use crate::client::{CandidateSlot, Message, ModelAdapter};
use crate::models::{CandidateError, CandidateResult, QAItem, RoundValue};
use crate::pipeline::{PipelineContext, PromptBuilder, RoundTurn};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Outcome of dispatching one item.
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    /// One result per configured candidate
    pub results: BTreeMap<String, CandidateResult>,
    /// Shutdown fired while a candidate was waiting to retry
    pub interrupted: bool,
}

impl Dispatch {
    /// Enabled candidates that produced no answer.
    pub fn failed_candidates(&self) -> Vec<String> {
        self.results
            .values()
            .filter(|r| r.is_failed())
            .map(|r| r.candidate_id.clone())
            .collect()
    }
}

/// Answer pulled out of a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub answer: String,
    pub rationale: String,
}

fn answer_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<answer>(.*?)</answer>").expect("valid answer tag regex")
    })
}

fn answer_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^[ \t*#]*(?:final\s+)?answer\s*[:：][ \t]*(.+?)[ \t*]*$")
            .expect("valid answer line regex")
    })
}

/// Inner text and byte span of the last balanced `\boxed{...}`.
fn last_boxed(text: &str) -> Option<(String, usize, usize)> {
    const OPEN: &str = "\\boxed{";
    let mut found = None;
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find(OPEN) {
        let start = search_from + offset;
        let inner_start = start + OPEN.len();
        let mut depth = 1usize;
        let mut end = None;
        for (i, c) in text[inner_start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(inner_start + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        if let Some(end) = end {
            let inner = text[inner_start..end].trim();
            if !inner.is_empty() {
                found = Some((inner.to_string(), start, end + 1));
            }
        }
        search_from = inner_start;
    }

    found
}

/// Pull the final answer out of a response.
///
/// Tries the last `\boxed{}`, then `<answer>` tags, then the last `Answer:`
/// line. The rationale is the response with the answer span removed.
pub fn extract_answer(text: &str) -> Option<Extracted> {
    let span = last_boxed(text)
        .or_else(|| {
            answer_tag_re()
                .captures_iter(text)
                .filter_map(|c| {
                    let whole = c.get(0)?;
                    let inner = c.get(1)?.as_str().trim();
                    (!inner.is_empty()).then(|| (inner.to_string(), whole.start(), whole.end()))
                })
                .last()
        })
        .or_else(|| {
            answer_line_re().captures_iter(text).last().and_then(|c| {
                let whole = c.get(0)?;
                let inner = c.get(1)?.as_str().trim();
                (!inner.is_empty()).then(|| (inner.to_string(), whole.start(), whole.end()))
            })
        });

    span.map(|(answer, start, end)| Extracted {
        answer,
        rationale: format!("{}{}", &text[..start], &text[end..]).trim().to_string(),
    })
}

/// Fans items out to every enabled candidate.
pub struct ResponderPool {
    slots: Arc<Vec<CandidateSlot>>,
    prompts: Arc<dyn PromptBuilder>,
}

impl ResponderPool {
    pub fn new(slots: Vec<CandidateSlot>, prompts: Arc<dyn PromptBuilder>) -> Self {
        Self {
            slots: Arc::new(slots),
            prompts,
        }
    }

    pub fn slots(&self) -> &[CandidateSlot] {
        &self.slots
    }

    pub fn enabled_count(&self) -> usize {
        self.slots.iter().filter(|s| s.enabled).count()
    }

    /// Collect one result per candidate for `item`.
    ///
    /// Candidates with an answered result in `known` are not invoked again.
    pub async fn dispatch(
        &self,
        item: &QAItem,
        known: &BTreeMap<String, CandidateResult>,
        ctx: &PipelineContext,
    ) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let mut pending = Vec::new();

        for slot in self.slots.iter() {
            match (&slot.adapter, slot.enabled) {
                (Some(adapter), true) => match known.get(&slot.name) {
                    Some(result) if result.is_answered() => {
                        debug!(item_id = %item.id, candidate = %slot.name, "Reusing known result");
                        dispatch.results.insert(slot.name.clone(), result.clone());
                    }
                    _ => pending.push((slot.name.clone(), Arc::clone(adapter))),
                },
                _ => {
                    dispatch
                        .results
                        .insert(slot.name.clone(), CandidateResult::disabled(&slot.name));
                }
            }
        }

        if pending.is_empty() {
            return dispatch;
        }

        let width = pending.len().min(ctx.settings.candidate_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(width));
        let item = Arc::new(item.clone());

        let mut handles = Vec::with_capacity(pending.len());
        for (name, adapter) in pending {
            let task = self.clone_for_task(name.clone(), adapter, &semaphore, &item, ctx);
            handles.push((name, tokio::spawn(async move { task.run().await })));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Answered::Done(result)) => {
                    dispatch.results.insert(name, result);
                }
                Ok(Answered::Interrupted(result)) => {
                    dispatch.interrupted = true;
                    dispatch.results.insert(name, result);
                }
                Err(e) => {
                    warn!(item_id = %item.id, candidate = %name, error = %e, "Candidate task panicked");
                    let mut result = CandidateResult::disabled(&name);
                    result.enabled = true;
                    result.answer = blank_like(&item);
                    result.error = Some(format!("task failed: {e}"));
                    dispatch.results.insert(name, result);
                }
            }
        }

        dispatch
    }

    /// Create a lightweight handle for one spawned candidate.
    fn clone_for_task(
        &self,
        name: String,
        adapter: Arc<dyn ModelAdapter>,
        semaphore: &Arc<Semaphore>,
        item: &Arc<QAItem>,
        ctx: &PipelineContext,
    ) -> CandidateTask {
        CandidateTask {
            name,
            adapter,
            prompts: Arc::clone(&self.prompts),
            semaphore: Arc::clone(semaphore),
            item: Arc::clone(item),
            ctx: ctx.clone(),
        }
    }
}

/// Empty answer of the item's shape.
fn blank_like(item: &QAItem) -> RoundValue {
    if item.multi_round {
        RoundValue::Rounds(BTreeMap::new())
    } else {
        RoundValue::default()
    }
}

enum Answered {
    Done(CandidateResult),
    Interrupted(CandidateResult),
}

/// One candidate working on one item.
struct CandidateTask {
    name: String,
    adapter: Arc<dyn ModelAdapter>,
    prompts: Arc<dyn PromptBuilder>,
    semaphore: Arc<Semaphore>,
    item: Arc<QAItem>,
    ctx: PipelineContext,
}

impl CandidateTask {
    async fn run(self) -> Answered {
        let mut result = CandidateResult::disabled(&self.name);
        result.enabled = true;
        result.answer = blank_like(&self.item);

        let Ok(_permit) = self.semaphore.acquire().await else {
            result.error = Some("candidate pool closed".to_string());
            return Answered::Done(result);
        };

        let transcript: Vec<Message> = self
            .prompts
            .candidate_system()
            .map(|s| vec![Message::system(s)])
            .unwrap_or_default();

        let outcome = if self.item.multi_round {
            self.run_rounds(&transcript, &mut result).await
        } else {
            let prompt = self.prompts.candidate_prompt(&self.item);
            self.ask(&prompt, &transcript, None, &mut result)
                .await
                .map(|extracted| {
                    result.answer = RoundValue::Single(extracted.answer);
                    result.rationale = RoundValue::Single(extracted.rationale);
                })
        };

        match outcome {
            Ok(()) => Answered::Done(result),
            Err(CandidateError::Interrupted) => {
                result.answer = blank_like(&self.item);
                result.error = Some(CandidateError::Interrupted.to_string());
                Answered::Interrupted(result)
            }
            Err(e) => {
                warn!(
                    item_id = %self.item.id,
                    candidate = %self.name,
                    attempts = result.attempts,
                    error = %e,
                    "Candidate gave up"
                );
                result.answer = blank_like(&self.item);
                result.rationale = RoundValue::default();
                let message = result.error.take().unwrap_or_else(|| e.to_string());
                result.error = Some(message);
                Answered::Done(result)
            }
        }
    }

    /// Answer each round in order, carrying earlier rounds in the prompt.
    async fn run_rounds(
        &self,
        transcript: &[Message],
        result: &mut CandidateResult,
    ) -> Result<(), CandidateError> {
        let mut answers = BTreeMap::new();
        let mut rationales = BTreeMap::new();
        let mut history: Vec<RoundTurn> = Vec::new();

        for round in self.item.rounds() {
            let prompt = self.prompts.round_prompt(&self.item, round, &history);
            let extracted = self
                .ask(&prompt, transcript, Some(round), result)
                .await
                .inspect_err(|e| {
                    if !matches!(e, CandidateError::Interrupted) {
                        result.error = Some(format!("{round}: {e}"));
                    }
                })?;

            history.push(RoundTurn {
                round: round.to_string(),
                question: self.item.question.round(round).unwrap_or_default().to_string(),
                answer: extracted.answer.clone(),
            });
            answers.insert(round.to_string(), extracted.answer);
            rationales.insert(round.to_string(), extracted.rationale);
        }

        result.answer = RoundValue::Rounds(answers);
        result.rationale = RoundValue::Rounds(rationales);
        Ok(())
    }

    /// One prompt with retries; updates attempts and latency on `result`.
    async fn ask(
        &self,
        prompt: &str,
        transcript: &[Message],
        round: Option<&str>,
        result: &mut CandidateResult,
    ) -> Result<Extracted, CandidateError> {
        let settings = &self.ctx.settings;
        let timeout = settings.candidate_timeout;
        let mut last_error = CandidateError::EmptyOutput;

        for retry in 0..=settings.max_retries {
            if retry > 0 {
                let delay = settings.backoff(retry);
                debug!(
                    item_id = %self.item.id,
                    candidate = %self.name,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Retrying candidate"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.ctx.shutdown.triggered() => return Err(CandidateError::Interrupted),
                }
            }

            result.attempts += 1;
            let attempt = result.attempts;
            let call = self.adapter.invoke(prompt, transcript, timeout);

            let error = match tokio::time::timeout(timeout, call).await {
                Err(_) => CandidateError::Timeout(timeout),
                Ok(Err(e)) => CandidateError::Adapter(e.to_string()),
                Ok(Ok(completion)) => {
                    let latency_ms = completion.latency.as_millis() as u64;
                    result.latency_ms += latency_ms;
                    self.ctx.audit(AuditEvent::Candidate {
                        item_id: &self.item.id,
                        candidate: &self.name,
                        round,
                        attempt,
                        prompt,
                        response: &completion.raw,
                        latency_ms,
                    });

                    if completion.text.trim().is_empty() {
                        CandidateError::EmptyOutput
                    } else {
                        match extract_answer(&completion.text) {
                            Some(extracted) => return Ok(extracted),
                            None => CandidateError::NoAnswer,
                        }
                    }
                }
            };

            if matches!(error, CandidateError::Timeout(_) | CandidateError::Adapter(_)) {
                self.ctx.audit(AuditEvent::CandidateFailure {
                    item_id: &self.item.id,
                    candidate: &self.name,
                    round,
                    attempt,
                    error: error.to_string(),
                });
            }
            last_error = error;
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockAdapter;
    use crate::models::TierError;
    use crate::pipeline::context::testing::{context, fast_settings};
    use crate::pipeline::{DefaultPrompts, shutdown_channel};
    use std::time::Duration;
    use tempfile::TempDir;

    fn single(id: &str) -> QAItem {
        QAItem::new(
            id,
            RoundValue::Single("2+2?".to_string()),
            RoundValue::Single("4".to_string()),
        )
    }

    fn two_rounds() -> QAItem {
        let map = |a: &str, b: &str| {
            RoundValue::Rounds(BTreeMap::from([
                ("round1".to_string(), a.to_string()),
                ("round2".to_string(), b.to_string()),
            ]))
        };
        QAItem::new("m1", map("first?", "second?"), map("1", "2"))
    }

    fn pool(slots: Vec<CandidateSlot>) -> ResponderPool {
        ResponderPool::new(slots, Arc::new(DefaultPrompts::default()))
    }

    #[test]
    fn test_extract_last_boxed_with_nested_braces() {
        let text = "Try \\boxed{3} first. Actually \\boxed{\\frac{1}{2}} is right.";
        let extracted = extract_answer(text).unwrap();
        assert_eq!(extracted.answer, "\\frac{1}{2}");
        assert_eq!(extracted.rationale, "Try \\boxed{3} first. Actually  is right.");
    }

    #[test]
    fn test_extract_fallbacks() {
        let tagged = extract_answer("thinking <answer> B </answer>").unwrap();
        assert_eq!(tagged.answer, "B");
        assert_eq!(tagged.rationale, "thinking");

        let line = extract_answer("Work it out.\nFinal Answer: 42\n").unwrap();
        assert_eq!(line.answer, "42");
        assert_eq!(line.rationale, "Work it out.");

        assert!(extract_answer("no idea").is_none());
        assert!(extract_answer("\\boxed{}").is_none());
        assert!(extract_answer("\\boxed{unclosed").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_collects_every_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let a = Arc::new(MockAdapter::fixed("a", "so \\boxed{4}"));
        let pool = pool(vec![
            CandidateSlot::enabled("model1", a.clone()),
            CandidateSlot::enabled("model2", Arc::new(MockAdapter::fixed("b", "\\boxed{5}"))),
            CandidateSlot::disabled("model3"),
        ]);

        let dispatch = pool.dispatch(&single("q1"), &BTreeMap::new(), &ctx).await;
        assert!(!dispatch.interrupted);
        assert_eq!(dispatch.results.len(), 3);
        assert_eq!(dispatch.results["model1"].answer, RoundValue::Single("4".to_string()));
        assert_eq!(dispatch.results["model1"].rationale, RoundValue::Single("so".to_string()));
        assert_eq!(dispatch.results["model1"].attempts, 1);
        assert!(!dispatch.results["model3"].enabled);
        assert!(dispatch.failed_candidates().is_empty());
        assert_eq!(a.calls(), 1);
        assert_eq!(a.transcripts()[0].len(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_answer() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let flaky = Arc::new(
            MockAdapter::fixed("flaky", "\\boxed{4}")
                .then(Err(TierError::Internal("boom".to_string())))
                .then(Ok("   ".to_string())),
        );
        let pool = pool(vec![CandidateSlot::enabled("model1", flaky.clone())]);

        let dispatch = pool.dispatch(&single("q1"), &BTreeMap::new(), &ctx).await;
        let result = &dispatch.results["model1"];
        assert_eq!(result.answer, RoundValue::Single("4".to_string()));
        assert_eq!(result.attempts, 3);
        assert!(result.error.is_none());
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_failed_result() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let pool = pool(vec![
            CandidateSlot::enabled("model1", Arc::new(MockAdapter::fixed("a", "\\boxed{4}"))),
            CandidateSlot::enabled("model2", Arc::new(MockAdapter::fixed("b", "I refuse."))),
        ]);

        let dispatch = pool.dispatch(&single("q1"), &BTreeMap::new(), &ctx).await;
        let failed = &dispatch.results["model2"];
        assert!(failed.enabled);
        assert!(failed.answer.is_blank());
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.error.as_deref(), Some("no answer could be extracted"));
        assert_eq!(dispatch.failed_candidates(), vec!["model2".to_string()]);
        assert!(dispatch.results["model1"].is_answered());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let mut settings = fast_settings();
        settings.candidate_timeout = Duration::from_millis(10);
        settings.max_retries = 0;
        let ctx = context(temp_dir.path(), settings, shutdown);

        let slow = MockAdapter::fixed("slow", "\\boxed{4}").with_delay(Duration::from_secs(5));
        let pool = pool(vec![CandidateSlot::enabled("model1", Arc::new(slow))]);

        let dispatch = pool.dispatch(&single("q1"), &BTreeMap::new(), &ctx).await;
        let result = &dispatch.results["model1"];
        assert!(result.is_failed());
        assert!(result.error.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_known_results_are_not_reinvoked() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let a = Arc::new(MockAdapter::fixed("a", "\\boxed{9}"));
        let b = Arc::new(MockAdapter::fixed("b", "\\boxed{4}"));
        let pool = pool(vec![
            CandidateSlot::enabled("model1", a.clone()),
            CandidateSlot::enabled("model2", b.clone()),
        ]);

        let mut known_result = CandidateResult::disabled("model1");
        known_result.enabled = true;
        known_result.answer = RoundValue::Single("4".to_string());
        let known = BTreeMap::from([("model1".to_string(), known_result.clone())]);

        let dispatch = pool.dispatch(&single("q1"), &known, &ctx).await;
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
        assert_eq!(dispatch.results["model1"], known_result);
    }

    #[tokio::test]
    async fn test_rounds_run_in_order_with_history() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let adapter = Arc::new(MockAdapter::with_fn("a", |prompt| {
            if prompt.contains("Now round2") {
                Ok("\\boxed{2}".to_string())
            } else {
                Ok("\\boxed{1}".to_string())
            }
        }));
        let pool = pool(vec![CandidateSlot::enabled("model1", adapter.clone())]);

        let dispatch = pool.dispatch(&two_rounds(), &BTreeMap::new(), &ctx).await;
        let result = &dispatch.results["model1"];
        assert_eq!(result.answer.round("round1"), Some("1"));
        assert_eq!(result.answer.round("round2"), Some("2"));

        let prompts = adapter.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with("round1: first?"));
        assert!(prompts[1].contains("round1 your answer: 1"));
    }

    #[tokio::test]
    async fn test_failed_round_clears_answer() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let mut settings = fast_settings();
        settings.max_retries = 0;
        let ctx = context(temp_dir.path(), settings, shutdown);

        let adapter = MockAdapter::fixed("a", "nothing useful").then(Ok("\\boxed{1}".to_string()));
        let pool = pool(vec![CandidateSlot::enabled("model1", Arc::new(adapter))]);

        let dispatch = pool.dispatch(&two_rounds(), &BTreeMap::new(), &ctx).await;
        let result = &dispatch.results["model1"];
        assert_eq!(result.answer, RoundValue::Rounds(BTreeMap::new()));
        assert!(result.is_failed());
        assert!(result.error.as_deref().unwrap().contains("round2"));
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_interrupts() {
        let temp_dir = TempDir::new().unwrap();
        let (trigger, shutdown) = shutdown_channel();
        let mut settings = fast_settings();
        settings.backoff_base = Duration::from_secs(60);
        let ctx = context(temp_dir.path(), settings, shutdown);

        let adapter = Arc::new(MockAdapter::failing("a"));
        let pool = pool(vec![CandidateSlot::enabled("model1", adapter.clone())]);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        let dispatch = pool.dispatch(&single("q1"), &BTreeMap::new(), &ctx).await;
        stopper.await.unwrap();

        assert!(dispatch.interrupted);
        assert_eq!(adapter.calls(), 1);
    }
}
