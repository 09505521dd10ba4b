//! Judge service: decides whether candidate answers match the ground truth.
//!
//! Epistemic foundation:
//! - K_i: A multi-round answer matches only if every round matches
//! - K_i: A missing or blank round is a non-match and costs no judge call
//! - B_i: Judge output may be malformed → parser chain, then comparator
//! - I^B: Judge calls may fail or hang → comparator, never an item failure

use crate::checkpoint::AuditEvent;
use crate::client::{Message, ModelAdapter};
use crate::models::{CandidateResult, JudgeVerdict, QAItem, VerdictSource};
use crate::pipeline::{JudgeRequest, PipelineContext, PromptBuilder, judge_options};
use crate::pool::verdict::{VerdictParser, compare_answers, default_chain, parse_verdict};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Verdicts for one candidate on one item.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateJudgement {
    pub matches: bool,
    /// Per-round verdicts (multi-round items only)
    pub round_matches: Option<BTreeMap<String, bool>>,
    pub reasoning: String,
    pub latency_ms: u64,
}

impl CandidateJudgement {
    /// Record the judgement on the candidate result.
    pub fn apply(self, result: &mut CandidateResult, debug: bool) {
        result.matches_ground_truth = result.enabled && self.matches;
        result.round_matches = self.round_matches;
        if debug {
            result.judge_reasoning = Some(self.reasoning);
            result.judge_latency_ms = Some(self.latency_ms);
        }
    }
}

/// Judge backed by one model adapter.
pub struct JudgeService {
    adapter: Arc<dyn ModelAdapter>,
    prompts: Arc<dyn PromptBuilder>,
    parsers: Vec<Box<dyn VerdictParser>>,
    timeout: Duration,
}

impl JudgeService {
    pub fn new(
        adapter: Arc<dyn ModelAdapter>,
        prompts: Arc<dyn PromptBuilder>,
        timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            prompts,
            parsers: default_chain(),
            timeout,
        }
    }

    /// Judge one answer (or one round of an answer). Never fails.
    pub async fn judge(
        &self,
        request: &JudgeRequest<'_>,
        item_id: &str,
        candidate: &str,
        ctx: &PipelineContext,
    ) -> JudgeVerdict {
        let prompt = self.prompts.judge_prompt(request);
        let transcript = [Message::system(self.prompts.judge_system())];

        let call = self.adapter.invoke(&prompt, &transcript, self.timeout);
        let (parsed, latency_ms, raw) = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(completion)) => {
                let latency_ms = completion.latency.as_millis() as u64;
                let parsed = parse_verdict(
                    &self.parsers,
                    &completion.text,
                    request.answer,
                    request.ground_truth,
                );
                (parsed, latency_ms, Some(completion.text))
            }
            Ok(Err(e)) => {
                warn!(item_id = %item_id, candidate = %candidate, error = %e, "Judge call failed, comparing answers");
                let why = format!("judge unavailable ({e})");
                (
                    compare_answers(request.answer, request.ground_truth, &why),
                    0,
                    None,
                )
            }
            Err(_) => {
                warn!(item_id = %item_id, candidate = %candidate, timeout_secs = self.timeout.as_secs(), "Judge timed out, comparing answers");
                (
                    compare_answers(request.answer, request.ground_truth, "judge timed out"),
                    self.timeout.as_millis() as u64,
                    None,
                )
            }
        };

        if parsed.source == VerdictSource::Comparator && raw.is_some() {
            debug!(item_id = %item_id, candidate = %candidate, "Judge output unparsable, compared answers");
        }

        ctx.audit(AuditEvent::Judge {
            item_id,
            candidate,
            round: request.round,
            prompt: &prompt,
            response: raw.as_deref(),
            is_match: parsed.is_match,
            source: parsed.source,
            latency_ms,
        });

        JudgeVerdict {
            is_match: parsed.is_match,
            reasoning: parsed.reasoning,
            latency_ms,
            source: parsed.source,
            raw,
        }
    }

    /// Judge every round a candidate answered; the item matches if all rounds do.
    pub async fn judge_candidate(
        &self,
        item: &QAItem,
        result: &CandidateResult,
        ctx: &PipelineContext,
    ) -> CandidateJudgement {
        if !item.multi_round {
            let answer = result.answer.flatten();
            let ground_truth = item.ground_truth.flatten();
            let question = item.question.flatten();
            let options = judge_options(item, None);
            let verdict = self
                .judge(
                    &JudgeRequest {
                        question: &question,
                        options: options.as_deref(),
                        ground_truth: &ground_truth,
                        answer: &answer,
                        round: None,
                    },
                    &item.id,
                    &result.candidate_id,
                    ctx,
                )
                .await;
            return CandidateJudgement {
                matches: verdict.is_match,
                round_matches: None,
                reasoning: verdict.reasoning,
                latency_ms: verdict.latency_ms,
            };
        }

        let mut round_matches = BTreeMap::new();
        let mut reasons = Vec::new();
        let mut latency_ms = 0;

        for round in item.ground_truth.round_keys() {
            let answer = match result.answer.round(round) {
                Some(answer) if !answer.trim().is_empty() => answer,
                _ => {
                    round_matches.insert(round.to_string(), false);
                    reasons.push(format!("{round}: no answer"));
                    continue;
                }
            };

            let options = judge_options(item, Some(round));
            let verdict = self
                .judge(
                    &JudgeRequest {
                        question: item.question.round(round).unwrap_or_default(),
                        options: options.as_deref(),
                        ground_truth: item.ground_truth.round(round).unwrap_or_default(),
                        answer,
                        round: Some(round),
                    },
                    &item.id,
                    &result.candidate_id,
                    ctx,
                )
                .await;

            latency_ms += verdict.latency_ms;
            reasons.push(format!("{round}: {}", verdict.reasoning));
            round_matches.insert(round.to_string(), verdict.is_match);
        }

        CandidateJudgement {
            matches: !round_matches.is_empty() && round_matches.values().all(|m| *m),
            round_matches: Some(round_matches),
            reasoning: reasons.join("\n"),
            latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockAdapter;
    use crate::models::{RoundValue, TierError};
    use crate::pipeline::context::testing::{context, fast_settings};
    use crate::pipeline::{DefaultPrompts, shutdown_channel};
    use tempfile::TempDir;

    fn service(adapter: Arc<MockAdapter>) -> JudgeService {
        JudgeService::new(
            adapter,
            Arc::new(DefaultPrompts::default()),
            Duration::from_secs(5),
        )
    }

    fn answered(name: &str, answer: RoundValue) -> CandidateResult {
        let mut result = CandidateResult::disabled(name);
        result.enabled = true;
        result.answer = answer;
        result
    }

    fn rounds(pairs: &[(&str, &str)]) -> RoundValue {
        RoundValue::Rounds(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_single_round_verdict() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let judge = Arc::new(MockAdapter::fixed(
            "judge",
            r#"{"match": true, "reasoning": "both say four"}"#,
        ));
        let item = QAItem::new(
            "q1",
            RoundValue::Single("2+2?".to_string()),
            RoundValue::Single("4".to_string()),
        );

        let judgement = service(judge.clone())
            .judge_candidate(&item, &answered("model1", RoundValue::Single("four".to_string())), &ctx)
            .await;
        assert!(judgement.matches);
        assert_eq!(judgement.reasoning, "both say four");
        assert!(judgement.round_matches.is_none());
        assert!(judge.prompts()[0].contains("[Model answer]\nfour"));
    }

    #[tokio::test]
    async fn test_prose_marker_verdict() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let judge = Arc::new(MockAdapter::fixed("judge", "Looks equivalent to me. match: true"));
        let verdict = service(judge)
            .judge(
                &JudgeRequest {
                    question: "q",
                    options: None,
                    ground_truth: "x",
                    answer: "y",
                    round: None,
                },
                "q1",
                "model1",
                &ctx,
            )
            .await;
        assert!(verdict.is_match);
        assert_eq!(verdict.source, VerdictSource::Marker);
    }

    #[tokio::test]
    async fn test_judge_failure_falls_back_to_comparator() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let judge = Arc::new(
            MockAdapter::fixed("judge", "unused")
                .then(Err(TierError::Internal("down".to_string()))),
        );
        let verdict = service(judge)
            .judge(
                &JudgeRequest {
                    question: "q",
                    options: None,
                    ground_truth: "Paris",
                    answer: " paris ",
                    round: None,
                },
                "q1",
                "model1",
                &ctx,
            )
            .await;
        assert!(verdict.is_match);
        assert_eq!(verdict.source, VerdictSource::Comparator);
        assert!(verdict.raw.is_none());
    }

    #[tokio::test]
    async fn test_judge_timeout_falls_back_to_comparator() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let slow = MockAdapter::fixed("judge", r#"{"match": true}"#)
            .with_delay(Duration::from_secs(5));
        let judge = JudgeService::new(
            Arc::new(slow),
            Arc::new(DefaultPrompts::default()),
            Duration::from_millis(10),
        );
        let verdict = judge
            .judge(
                &JudgeRequest {
                    question: "q",
                    options: None,
                    ground_truth: "a",
                    answer: "b",
                    round: None,
                },
                "q1",
                "model1",
                &ctx,
            )
            .await;
        assert!(!verdict.is_match);
        assert_eq!(verdict.source, VerdictSource::Comparator);
    }

    #[tokio::test]
    async fn test_multi_round_is_and_of_rounds() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let judge = Arc::new(MockAdapter::with_fn("judge", |prompt| {
            if prompt.contains("[Round]\nround2") {
                Ok(r#"{"match": false, "reasoning": "wrong"}"#.to_string())
            } else {
                Ok(r#"{"match": true, "reasoning": "right"}"#.to_string())
            }
        }));
        let item = QAItem::new(
            "m1",
            rounds(&[("round1", "a?"), ("round2", "b?")]),
            rounds(&[("round1", "A"), ("round2", "B")]),
        );
        let result = answered("model1", rounds(&[("round1", "A"), ("round2", "C")]));

        let judgement = service(judge.clone()).judge_candidate(&item, &result, &ctx).await;
        assert!(!judgement.matches);
        let per_round = judgement.round_matches.unwrap();
        assert_eq!(per_round["round1"], true);
        assert_eq!(per_round["round2"], false);
        assert_eq!(judge.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_round_skips_judge_call() {
        let temp_dir = TempDir::new().unwrap();
        let (_trigger, shutdown) = shutdown_channel();
        let ctx = context(temp_dir.path(), fast_settings(), shutdown);

        let judge = Arc::new(MockAdapter::fixed("judge", r#"{"match": true}"#));
        let item = QAItem::new(
            "m1",
            rounds(&[("round1", "a?"), ("round2", "b?")]),
            rounds(&[("round1", "A"), ("round2", "B")]),
        );
        let result = answered("model1", rounds(&[("round1", "A"), ("round2", "  ")]));

        let mut judgement = service(judge.clone()).judge_candidate(&item, &result, &ctx).await;
        assert_eq!(judge.calls(), 1);
        assert!(!judgement.matches);
        assert_eq!(judgement.round_matches.take().unwrap()["round2"], false);

        let mut applied = result.clone();
        judgement.apply(&mut applied, true);
        assert!(!applied.matches_ground_truth);
        assert!(applied.judge_reasoning.unwrap().contains("round2: no answer"));
    }
}
