//! Input loading and normalization into canonical QA items.
//!
//! Epistemic foundation:
//! - B_i: Input records use varied field names and shapes → alias tables
//! - K_i: A rejected record is logged and skipped, never fatal
//! - K_i: Item ids are unique after normalization

use crate::models::{QAItem, Result, RoundValue, TierError, ValidationError};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

const ID_KEYS: [&str; 4] = ["id", "question_id", "qid", "uid"];
const QUESTION_KEYS: [&str; 4] = ["question", "Q", "query", "Q_rounds"];
const GROUND_TRUTH_KEYS: [&str; 6] = ["answer", "ground_truth", "gt", "GT", "A", "A_rounds"];
const OPTION_KEYS: [&str; 2] = ["options", "choices"];
// Output record fields; input copies would collide when serialized
const RESERVED_KEYS: [&str; 5] = [
    "multi_round",
    "candidates",
    "classification",
    "error",
    "finalized_at",
];

fn round_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(round|turn|r)[_\- ]?\d+$").expect("valid round key regex"))
}

/// True when `key` names a dialogue round (`round1`, `Turn_2`, `r3`, …).
pub fn is_round_key(key: &str) -> bool {
    round_key_re().is_match(key.trim())
}

/// Text form of a scalar or nested value.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Map a field onto a single value or a round-keyed value.
fn round_value(value: &Value) -> RoundValue {
    match value {
        Value::Object(map) if map.keys().any(|k| is_round_key(k)) => RoundValue::Rounds(
            map.iter()
                .map(|(k, v)| (k.clone(), value_text(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
        other => RoundValue::Single(value_text(other)),
    }
}

/// Options render as `A: text; B: text` unless they are round-keyed.
fn options_value(value: &Value) -> RoundValue {
    match value {
        Value::Object(map) if !map.keys().any(|k| is_round_key(k)) => RoundValue::Single(
            map.iter()
                .map(|(k, v)| format!("{k}: {}", value_text(v)))
                .collect::<Vec<_>>()
                .join("; "),
        ),
        Value::Array(values) => RoundValue::Single(
            values
                .iter()
                .map(value_text)
                .collect::<Vec<_>>()
                .join("; "),
        ),
        other => round_value(other),
    }
}

fn first_present<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
}

/// Records accepted and rejected by one normalization pass.
#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub items: Vec<QAItem>,
    pub rejected: Vec<ValidationError>,
}

impl NormalizeReport {
    pub fn skipped(&self) -> usize {
        self.rejected.len()
    }
}

/// Turns raw records into canonical items, tracking ids already seen.
#[derive(Debug, Default)]
pub struct DataNormalizer {
    seen: HashSet<String>,
}

impl DataNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one record; `index` is its position in the input.
    pub fn normalize(&mut self, index: usize, record: &Value) -> std::result::Result<QAItem, ValidationError> {
        let Value::Object(fields) = record else {
            return Err(ValidationError::NotAnObject { index });
        };

        let id = match first_present(fields, &ID_KEYS) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(value @ Value::Number(_)) => value.to_string(),
            _ => return Err(ValidationError::MissingId { index }),
        };

        let question = first_present(fields, &QUESTION_KEYS)
            .map(round_value)
            .filter(|q| !q.is_blank())
            .ok_or_else(|| ValidationError::MissingQuestion { id: id.clone() })?;

        let ground_truth = first_present(fields, &GROUND_TRUTH_KEYS)
            .map(round_value)
            .filter(|gt| !gt.is_blank())
            .ok_or_else(|| ValidationError::MissingGroundTruth { id: id.clone() })?;

        if question.is_rounds() != ground_truth.is_rounds() {
            return Err(ValidationError::ShapeMismatch { id });
        }

        if !self.seen.insert(id.clone()) {
            return Err(ValidationError::DuplicateId { id });
        }

        let mut item = QAItem::new(id, question, ground_truth);
        if let Some(options) = first_present(fields, &OPTION_KEYS).map(options_value) {
            if !options.is_blank() {
                item = item.with_options(options);
            }
        }

        let known: HashSet<&str> = ID_KEYS
            .iter()
            .chain(&QUESTION_KEYS)
            .chain(&GROUND_TRUTH_KEYS)
            .chain(&OPTION_KEYS)
            .chain(&RESERVED_KEYS)
            .copied()
            .collect();
        item.extensions = fields
            .iter()
            .filter(|(k, _)| !known.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(item)
    }

    /// Normalize a batch, logging and collecting rejections.
    pub fn normalize_all(&mut self, records: impl IntoIterator<Item = Value>) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        for (index, record) in records.into_iter().enumerate() {
            match self.normalize(index, &record) {
                Ok(item) => report.items.push(item),
                Err(e) => {
                    warn!(index, error = %e, "Skipping invalid record");
                    report.rejected.push(e);
                }
            }
        }

        info!(
            accepted = report.items.len(),
            skipped = report.rejected.len(),
            multi_round = report.items.iter().filter(|i| i.multi_round).count(),
            "Normalized input records"
        );
        report
    }
}

/// Read raw records from a `.jsonl` or `.json` file.
///
/// JSON files may hold an array, an object with an `items` or `data` array,
/// or a single record.
pub fn load_records(path: &Path) -> Result<Vec<Value>> {
    let is_jsonl = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));

    if is_jsonl {
        let file = File::open(path).map_err(|e| TierError::io("opening input file", e))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| TierError::io("reading input file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = line_num + 1, error = %e, "Skipping unparsable input line"),
            }
        }

        info!(count = records.len(), path = %path.display(), "Loaded records");
        return Ok(records);
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| TierError::io("reading input file", e))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| TierError::ParseError(format!("{}: {e}", path.display())))?;

    let records = match value {
        Value::Array(records) => records,
        Value::Object(mut map) => match ["items", "data"]
            .iter()
            .find(|k| map.get(**k).is_some_and(Value::is_array))
        {
            Some(key) => match map.remove(*key) {
                Some(Value::Array(records)) => records,
                _ => Vec::new(),
            },
            None => vec![Value::Object(map)],
        },
        other => {
            return Err(TierError::InvalidInput(format!(
                "{}: expected an array or object, found {}",
                path.display(),
                match other {
                    Value::Null => "null",
                    Value::Bool(_) => "a boolean",
                    Value::Number(_) => "a number",
                    _ => "a string",
                }
            )));
        }
    };

    info!(count = records.len(), path = %path.display(), "Loaded records");
    Ok(records)
}
