//! Judge output parsing.
//!
//! Epistemic foundation:
//! - B_i: The judge was asked for JSON but may answer in prose → ordered fallbacks
//! - K_i: The chain is total: when every parser declines, the comparator decides

use crate::models::VerdictSource;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const MATCH_KEYS: [&str; 3] = ["match", "is_match", "result"];
const REASONING_KEYS: [&str; 3] = ["reasoning", "reason", "explanation"];

/// A verdict recovered from judge output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVerdict {
    pub is_match: bool,
    pub reasoning: String,
    pub source: VerdictSource,
}

/// One strategy in the parser chain.
pub trait VerdictParser: Send + Sync {
    fn source(&self) -> VerdictSource;

    /// `None` hands the text to the next parser.
    fn parse(&self, raw: &str) -> Option<ParsedVerdict>;
}

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fenced json regex")
    })
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)["']?\b(?:is_match|match|result)\b["']?\s*[:=]\s*["']?\b(true|false)\b"#)
            .expect("valid marker regex")
    })
}

/// Read a verdict out of a JSON object, if it has a usable match key.
fn verdict_from_json(text: &str, source: VerdictSource) -> Option<ParsedVerdict> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;

    let lookup = |keys: &[&str]| {
        keys.iter().find_map(|wanted| {
            object
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(wanted))
                .map(|(_, v)| v)
        })
    };

    let is_match = match lookup(&MATCH_KEYS)? {
        Value::Bool(b) => *b,
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => true,
            "false" | "no" => false,
            _ => return None,
        },
        _ => return None,
    };

    let reasoning = lookup(&REASONING_KEYS)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    Some(ParsedVerdict {
        is_match,
        reasoning,
        source,
    })
}

/// JSON object inside a (optionally `json`-tagged) code fence.
pub struct FencedJson;

impl VerdictParser for FencedJson {
    fn source(&self) -> VerdictSource {
        VerdictSource::FencedJson
    }

    fn parse(&self, raw: &str) -> Option<ParsedVerdict> {
        fenced_re()
            .captures_iter(raw)
            .filter_map(|c| c.get(1))
            .find_map(|m| verdict_from_json(m.as_str(), self.source()))
    }
}

/// Everything between the first `{` and the last `}`.
pub struct BracedJson;

impl VerdictParser for BracedJson {
    fn source(&self) -> VerdictSource {
        VerdictSource::BracedJson
    }

    fn parse(&self, raw: &str) -> Option<ParsedVerdict> {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end <= start {
            return None;
        }
        verdict_from_json(&raw[start..=end], self.source())
    }
}

/// `match: true`, `"result" = false` and similar markers in prose.
pub struct MarkerScan;

impl VerdictParser for MarkerScan {
    fn source(&self) -> VerdictSource {
        VerdictSource::Marker
    }

    fn parse(&self, raw: &str) -> Option<ParsedVerdict> {
        let captures = marker_re().captures(raw)?;
        let is_match = captures.get(1)?.as_str().eq_ignore_ascii_case("true");
        Some(ParsedVerdict {
            is_match,
            reasoning: raw.trim().to_string(),
            source: self.source(),
        })
    }
}

/// Parsers in the order they are tried.
pub fn default_chain() -> Vec<Box<dyn VerdictParser>> {
    vec![Box::new(FencedJson), Box::new(BracedJson), Box::new(MarkerScan)]
}

/// Run the chain over judge output, falling back to comparing the answers.
pub fn parse_verdict(
    parsers: &[Box<dyn VerdictParser>],
    raw: &str,
    answer: &str,
    ground_truth: &str,
) -> ParsedVerdict {
    parsers
        .iter()
        .find_map(|p| p.parse(raw))
        .unwrap_or_else(|| {
            compare_answers(answer, ground_truth, "judge output had no verdict")
        })
}

/// Comparator verdict: normalized string equality.
pub fn compare_answers(answer: &str, ground_truth: &str, why: &str) -> ParsedVerdict {
    let is_match = normalized_equal(answer, ground_truth);
    ParsedVerdict {
        is_match,
        reasoning: format!(
            "{why}; normalized answers {}",
            if is_match { "are equal" } else { "differ" }
        ),
        source: VerdictSource::Comparator,
    }
}

/// Collapse whitespace, trim and lowercase.
pub fn normalize_answer(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalized_equal(a: &str, b: &str) -> bool {
    normalize_answer(a) == normalize_answer(b)
}
