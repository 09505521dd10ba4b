//! Item and result types for tierqa.
//!
//! K_i: These types represent the core data flow through the pipeline:
//! QAItem → CandidateResult (+ JudgeVerdict) → Classification → FinalizedItem.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// A question, answer or option set: one string, or one string per round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoundValue {
    Single(String),
    Rounds(BTreeMap<String, String>),
}

impl Default for RoundValue {
    fn default() -> Self {
        Self::Single(String::new())
    }
}

impl RoundValue {
    pub fn is_rounds(&self) -> bool {
        matches!(self, Self::Rounds(_))
    }

    /// True when there is no usable content.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Single(s) => s.trim().is_empty(),
            Self::Rounds(map) => map.values().all(|v| v.trim().is_empty()),
        }
    }

    /// Value for one round. A single value answers every round.
    pub fn round(&self, key: &str) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s.as_str()),
            Self::Rounds(map) => map.get(key).map(String::as_str),
        }
    }

    /// Round keys in dialogue order (empty for single values).
    pub fn round_keys(&self) -> Vec<&str> {
        match self {
            Self::Single(_) => Vec::new(),
            Self::Rounds(map) => ordered_round_keys(map.keys().map(String::as_str)),
        }
    }

    /// Flatten to one line of text; rounds become `k: v; k: v` in dialogue order.
    pub fn flatten(&self) -> String {
        match self {
            Self::Single(s) => s.clone(),
            Self::Rounds(map) => self
                .round_keys()
                .into_iter()
                .map(|k| format!("{k}: {}", map[k]))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

impl fmt::Display for RoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

fn round_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid round number regex"))
}

/// Compare round keys by their first embedded integer, then lexically.
pub fn compare_round_keys(a: &str, b: &str) -> Ordering {
    let number = |k: &str| {
        round_number_re()
            .find(k)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    number(a).cmp(&number(b)).then_with(|| a.cmp(b))
}

/// Sort round keys into dialogue order.
pub fn ordered_round_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut keys: Vec<&str> = keys.collect();
    keys.sort_by(|a, b| compare_round_keys(a, b));
    keys
}

/// Canonical QA item.
///
/// K_i: Every item has an id, a question and a ground truth of the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QAItem {
    /// Unique identifier for this item
    pub id: String,

    /// Question text, or one question per round
    pub question: RoundValue,

    /// Reference answer, same shape as `question`
    pub ground_truth: RoundValue,

    /// Choice options (multiple-choice items)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<RoundValue>,

    /// Derived: question and ground truth are round-keyed
    #[serde(default)]
    pub multi_round: bool,

    /// Unknown input fields, passed through verbatim
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl QAItem {
    pub fn new(id: impl Into<String>, question: RoundValue, ground_truth: RoundValue) -> Self {
        let multi_round = question.is_rounds() && ground_truth.is_rounds();
        Self {
            id: id.into(),
            question,
            ground_truth,
            options: None,
            multi_round,
            extensions: serde_json::Map::new(),
        }
    }

    pub fn with_options(mut self, options: RoundValue) -> Self {
        self.options = Some(options);
        self
    }

    /// Round keys of the question in dialogue order.
    pub fn rounds(&self) -> Vec<&str> {
        self.question.round_keys()
    }

    /// String extension field, if present.
    pub fn extension_str(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).and_then(|v| v.as_str())
    }
}

/// Result of one candidate answering one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub candidate_id: String,

    pub enabled: bool,

    /// Extracted answer, mirroring the item's shape
    #[serde(default)]
    pub answer: RoundValue,

    /// Reasoning text surrounding the answer
    #[serde(default)]
    pub rationale: RoundValue,

    /// Total response time across attempts and rounds
    #[serde(default)]
    pub latency_ms: u64,

    /// AND of all round verdicts; always false when disabled
    #[serde(default)]
    pub matches_ground_truth: bool,

    /// Per-round verdicts (multi-round items only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_matches: Option<BTreeMap<String, bool>>,

    /// Adapter attempts made (0 when reused or disabled)
    #[serde(default)]
    pub attempts: u32,

    /// Last failure message, if the candidate gave up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Judge reasoning (debug mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_reasoning: Option<String>,

    /// Judge time in milliseconds (debug mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_latency_ms: Option<u64>,
}

impl CandidateResult {
    /// Result for a candidate that is switched off in configuration.
    pub fn disabled(candidate_id: impl Into<String>) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            enabled: false,
            answer: RoundValue::default(),
            rationale: RoundValue::default(),
            latency_ms: 0,
            matches_ground_truth: false,
            round_matches: None,
            attempts: 0,
            error: None,
            judge_reasoning: None,
            judge_latency_ms: None,
        }
    }

    /// Enabled candidate that produced no answer.
    pub fn is_failed(&self) -> bool {
        self.enabled && self.answer.is_blank()
    }

    /// Enabled candidate with a usable answer.
    pub fn is_answered(&self) -> bool {
        self.enabled && !self.answer.is_blank()
    }
}

/// Which parser strategy produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    FencedJson,
    BracedJson,
    Marker,
    Comparator,
}

impl fmt::Display for VerdictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FencedJson => "fenced_json",
            Self::BracedJson => "braced_json",
            Self::Marker => "marker",
            Self::Comparator => "comparator",
        };
        f.write_str(s)
    }
}

/// Verdict from the judge for one answer (or one round of an answer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub is_match: bool,
    pub reasoning: String,
    pub latency_ms: u64,
    pub source: VerdictSource,
    /// Raw judge output, kept for the audit log only
    #[serde(skip)]
    pub raw: Option<String>,
}

/// Difficulty tier, from full agreement (tier1) to none (tier4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Tier4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
            Self::Tier3 => "tier3",
            Self::Tier4 => "tier4",
        }
    }

    /// Ordinal 1..=4.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Tier1 => 1,
            Self::Tier2 => 2,
            Self::Tier3 => 3,
            Self::Tier4 => 4,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a judged item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: Tier,
    pub agreement_count: usize,
    pub enabled_count: usize,
    pub category: String,
}

/// Error marker for items withheld from classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Enabled candidates that produced no answer
    pub failed_candidates: Vec<String>,
    pub message: String,
}

/// An item after the pipeline: classified, or marked as errored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedItem {
    #[serde(flatten)]
    pub item: QAItem,

    /// Candidate results keyed by candidate id
    pub candidates: BTreeMap<String, CandidateResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,

    pub finalized_at: DateTime<Utc>,
}

impl FinalizedItem {
    pub fn classified(
        item: QAItem,
        candidates: BTreeMap<String, CandidateResult>,
        classification: Classification,
    ) -> Self {
        Self {
            item,
            candidates,
            classification: Some(classification),
            error: None,
            finalized_at: Utc::now(),
        }
    }

    pub fn failed(
        item: QAItem,
        candidates: BTreeMap<String, CandidateResult>,
        failed_candidates: Vec<String>,
    ) -> Self {
        let message = format!("no answer from: {}", failed_candidates.join(", "));
        Self {
            item,
            candidates,
            classification: None,
            error: Some(ItemError {
                failed_candidates,
                message,
            }),
            finalized_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    /// Tier this item belongs to; `None` for errored items.
    pub fn tier(&self) -> Option<Tier> {
        match (&self.classification, &self.error) {
            (Some(c), None) => Some(c.tier),
            _ => None,
        }
    }

    /// Successful results worth reusing on a retry pass.
    pub fn answered_candidates(&self) -> BTreeMap<String, CandidateResult> {
        self.candidates
            .iter()
            .filter(|(_, r)| r.is_answered())
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }
}
