//! Prompt construction for candidates and the judge.
//!
//! K_i: Candidates are asked to put the final answer in `\boxed{}`.
//! K_i: The judge is asked for `{"match": bool, "reasoning": string}`.
//! I^R: Both system prompts can be replaced by files from `[prompts]`.

use crate::models::{PromptConfig, QAItem, Result, RoundValue, TierError};
use std::path::Path;

const CANDIDATE_SYSTEM: &str = "You are answering exam questions. Think the problem through, \
then give your final answer inside \\boxed{}. For multiple-choice questions put only the \
option letter(s) in the box, separated by commas when more than one applies.";

const JUDGE_SYSTEM: &str = r#"You are a strict answer grader. Decide whether the model answer agrees with the reference answer.

Rules:
1. Meaning over form: "10.5" and "10.50" agree, so do "Beijing" and "Beijing, China".
2. Ignore punctuation, markdown and letter case.
3. Numbers must be exact when the question asks for a computed value.
4. When the reference holds several answers (multiple choice, several sub-questions), every one must be present and correct. Partially correct is not a match.

Reply with a single JSON object and nothing else:
{"match": true, "reasoning": "one short sentence"}"#;

const BOXED_REMINDER: &str = "Put your final answer inside \\boxed{}.";

/// One earlier round of a multi-round dialogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTurn {
    pub round: String,
    pub question: String,
    pub answer: String,
}

/// Inputs to a single judge call.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub question: &'a str,
    pub options: Option<&'a str>,
    pub ground_truth: &'a str,
    pub answer: &'a str,
    /// Round key for multi-round items
    pub round: Option<&'a str>,
}

/// Builds every prompt the pipeline sends.
pub trait PromptBuilder: Send + Sync {
    /// System message for candidates, if any.
    fn candidate_system(&self) -> Option<&str>;

    fn judge_system(&self) -> &str;

    /// Prompt for a single-round item.
    fn candidate_prompt(&self, item: &QAItem) -> String;

    /// Prompt for one round, carrying the candidate's earlier rounds.
    fn round_prompt(&self, item: &QAItem, round: &str, history: &[RoundTurn]) -> String;

    fn judge_prompt(&self, request: &JudgeRequest<'_>) -> String;
}

/// Built-in prompts, optionally with system prompts loaded from files.
#[derive(Debug, Clone)]
pub struct DefaultPrompts {
    candidate_system: String,
    judge_system: String,
}

impl Default for DefaultPrompts {
    fn default() -> Self {
        Self {
            candidate_system: CANDIDATE_SYSTEM.to_string(),
            judge_system: JUDGE_SYSTEM.to_string(),
        }
    }
}

impl DefaultPrompts {
    /// Apply file overrides from configuration.
    pub fn from_config(config: &PromptConfig) -> Result<Self> {
        let mut prompts = Self::default();
        if let Some(path) = &config.candidate_system {
            prompts.candidate_system = read_prompt(path, "reading candidate system prompt")?;
        }
        if let Some(path) = &config.judge_system {
            prompts.judge_system = read_prompt(path, "reading judge system prompt")?;
        }
        Ok(prompts)
    }
}

fn read_prompt(path: &Path, context: &str) -> Result<String> {
    let text = std::fs::read_to_string(path).map_err(|e| TierError::io(context, e))?;
    if text.trim().is_empty() {
        return Err(TierError::InvalidInput(format!(
            "prompt file {} is empty",
            path.display()
        )));
    }
    Ok(text.trim().to_string())
}

/// Options text for the whole item or for one round.
fn options_text(options: Option<&RoundValue>, round: Option<&str>) -> Option<String> {
    let options = options?;
    let text = match (options, round) {
        (RoundValue::Rounds(map), Some(round)) => map
            .get(round)
            .cloned()
            .unwrap_or_else(|| options.flatten()),
        _ => options.flatten(),
    };
    (!text.trim().is_empty()).then_some(text)
}

impl PromptBuilder for DefaultPrompts {
    fn candidate_system(&self) -> Option<&str> {
        (!self.candidate_system.is_empty()).then_some(self.candidate_system.as_str())
    }

    fn judge_system(&self) -> &str {
        &self.judge_system
    }

    fn candidate_prompt(&self, item: &QAItem) -> String {
        let mut prompt = item.question.flatten();
        if let Some(options) = options_text(item.options.as_ref(), None) {
            prompt.push_str("\n\nOptions:\n");
            prompt.push_str(&options);
        }
        prompt.push_str("\n\n");
        prompt.push_str(BOXED_REMINDER);
        prompt
    }

    fn round_prompt(&self, item: &QAItem, round: &str, history: &[RoundTurn]) -> String {
        let question = item.question.round(round).unwrap_or_default();
        let mut prompt = String::new();

        if !history.is_empty() {
            prompt.push_str("Earlier rounds of this dialogue:\n");
            for turn in history {
                prompt.push_str(&format!("{} question: {}\n", turn.round, turn.question));
                prompt.push_str(&format!("{} your answer: {}\n", turn.round, turn.answer));
            }
            prompt.push_str(&format!("\nNow {round}. Answer only this round.\n"));
        }

        prompt.push_str(&format!("{round}: {question}"));
        if let Some(options) = options_text(item.options.as_ref(), Some(round)) {
            prompt.push_str("\n\nOptions:\n");
            prompt.push_str(&options);
        }
        prompt.push_str("\n\n");
        prompt.push_str(BOXED_REMINDER);
        prompt
    }

    fn judge_prompt(&self, request: &JudgeRequest<'_>) -> String {
        let mut prompt = format!("[Question]\n{}\n", request.question);
        if let Some(round) = request.round {
            prompt = format!("[Round]\n{round}\n\n{prompt}");
        }
        if let Some(options) = request.options {
            prompt.push_str(&format!("\n[Options]\n{options}\n"));
        }
        prompt.push_str(&format!(
            "\n[Reference answer]\n{}\n\n[Model answer]\n{}\n",
            request.ground_truth, request.answer
        ));
        prompt
    }
}

/// Options text to show the judge for an item or round.
pub fn judge_options(item: &QAItem, round: Option<&str>) -> Option<String> {
    options_text(item.options.as_ref(), round)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn multi_round() -> QAItem {
        let q: BTreeMap<String, String> = [("round1", "Pick a colour"), ("round2", "Why?")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let a: BTreeMap<String, String> = [("round1", "A"), ("round2", "because")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QAItem::new("m1", RoundValue::Rounds(q), RoundValue::Rounds(a))
    }

    #[test]
    fn test_candidate_prompt_includes_options() {
        let item = QAItem::new(
            "q1",
            RoundValue::Single("Which is a prime?".to_string()),
            RoundValue::Single("B".to_string()),
        )
        .with_options(RoundValue::Single("A: 4; B: 7".to_string()));

        let prompt = DefaultPrompts::default().candidate_prompt(&item);
        assert!(prompt.starts_with("Which is a prime?"));
        assert!(prompt.contains("A: 4; B: 7"));
        assert!(prompt.contains("\\boxed{}"));
    }

    #[test]
    fn test_first_round_has_no_history() {
        let prompt = DefaultPrompts::default().round_prompt(&multi_round(), "round1", &[]);
        assert!(prompt.starts_with("round1: Pick a colour"));
        assert!(!prompt.contains("Earlier rounds"));
    }

    #[test]
    fn test_later_round_carries_history() {
        let history = vec![RoundTurn {
            round: "round1".to_string(),
            question: "Pick a colour".to_string(),
            answer: "A".to_string(),
        }];
        let prompt = DefaultPrompts::default().round_prompt(&multi_round(), "round2", &history);

        assert!(prompt.contains("round1 question: Pick a colour"));
        assert!(prompt.contains("round1 your answer: A"));
        assert!(prompt.contains("Now round2. Answer only this round."));
        assert!(prompt.contains("round2: Why?"));
    }

    #[test]
    fn test_judge_prompt_layout() {
        let prompt = DefaultPrompts::default().judge_prompt(&JudgeRequest {
            question: "2+2?",
            options: None,
            ground_truth: "4",
            answer: "four",
            round: None,
        });
        assert!(prompt.contains("[Reference answer]\n4"));
        assert!(prompt.contains("[Model answer]\nfour"));
        assert!(!prompt.contains("[Options]"));
    }

    #[test]
    fn test_system_prompt_override() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("judge.txt");
        std::fs::write(&path, "  Grade strictly.\n").unwrap();

        let prompts = DefaultPrompts::from_config(&PromptConfig {
            candidate_system: None,
            judge_system: Some(path),
        })
        .unwrap();
        assert_eq!(prompts.judge_system(), "Grade strictly.");
        assert!(prompts.candidate_system().unwrap().contains("\\boxed{}"));
    }

    #[test]
    fn test_missing_prompt_file_is_an_error() {
        let result = DefaultPrompts::from_config(&PromptConfig {
            candidate_system: Some("/nonexistent/prompt.txt".into()),
            judge_system: None,
        });
        assert!(matches!(result, Err(TierError::Io { .. })));
    }
}
