//! Append-only audit log of raw model and judge exchanges.
//!
//! K_i: One process-wide sink, one lock, one JSON object per line.
//! B_i: Audit writes may fail → logged, never propagated to the pipeline.

use crate::models::{Result, TierError, VerdictSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// One auditable exchange.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent<'a> {
    /// Candidate answered (possibly with unusable output)
    Candidate {
        item_id: &'a str,
        candidate: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<&'a str>,
        attempt: u32,
        prompt: &'a str,
        response: &'a serde_json::Value,
        latency_ms: u64,
    },
    /// Candidate call failed (timeout, error)
    CandidateFailure {
        item_id: &'a str,
        candidate: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<&'a str>,
        attempt: u32,
        error: String,
    },
    /// Judge verdict with the raw judge output
    Judge {
        item_id: &'a str,
        candidate: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<&'a str>,
        prompt: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<&'a str>,
        is_match: bool,
        source: VerdictSource,
        latency_ms: u64,
    },
}

#[derive(Serialize)]
struct AuditLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent<'a>,
}

/// Process-wide audit sink.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open (or create) the audit file in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TierError::io("creating audit log directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TierError::io("opening audit log", e))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are logged and swallowed.
    pub fn record(&self, event: &AuditEvent<'_>) {
        let line = AuditLine {
            at: Utc::now(),
            event,
        };
        let json = match serde_json::to_string(&line) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit event");
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{json}").and_then(|_| writer.flush()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write audit log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_are_appended_as_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs").join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        let response = serde_json::json!({"content": "\\boxed{4}"});
        log.record(&AuditEvent::Candidate {
            item_id: "q1",
            candidate: "model1",
            round: None,
            attempt: 1,
            prompt: "2+2?",
            response: &response,
            latency_ms: 12,
        });
        log.record(&AuditEvent::Judge {
            item_id: "q1",
            candidate: "model1",
            round: Some("round1"),
            prompt: "judge this",
            response: Some(r#"{"match": true}"#),
            is_match: true,
            source: VerdictSource::BracedJson,
            latency_ms: 3,
        });
        drop(log);

        // Reopening appends rather than truncating
        let log = AuditLog::open(&path).unwrap();
        log.record(&AuditEvent::CandidateFailure {
            item_id: "q2",
            candidate: "model2",
            round: None,
            attempt: 2,
            error: "timed out".to_string(),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "candidate");
        assert_eq!(lines[1]["kind"], "judge");
        assert_eq!(lines[1]["source"], "braced_json");
        assert_eq!(lines[2]["kind"], "candidate_failure");
        assert!(lines[2].get("round").is_none());
    }
}
