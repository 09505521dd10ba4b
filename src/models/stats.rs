//! Run tallies and the persisted summary artifact.

use super::{FinalizedItem, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tally for one orchestrator invocation.
///
/// K_i: Every input item ends in exactly one bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Items handed to the orchestrator
    pub total_items: usize,
    /// Records dropped by the normalizer
    pub validation_skipped: usize,
    /// Items already persisted by an earlier run
    pub resumed: usize,
    /// Items classified into a tier this run
    pub classified: usize,
    /// Items routed to the error partition this run
    pub errored: usize,
    /// Items promoted out of the error partition
    pub promoted: usize,
    /// Items left in the error partition by an earlier run and re-dispatched
    pub retried: usize,
    /// Items already classified in the output directory while resume is off;
    /// never re-run because their tier entry cannot be replaced
    pub already_classified: usize,
    /// Items never started or abandoned because of shutdown
    pub interrupted: usize,
    /// Per-tier counts for items classified this run
    pub tiers: BTreeMap<Tier, usize>,
    /// Flush attempts that failed (batches were retained)
    pub persistence_errors: usize,
    /// Whether the run stopped early on a shutdown signal
    pub cancelled: bool,
    /// Wall-clock runtime
    pub runtime_secs: f64,
}

impl RunReport {
    pub fn record_tier(&mut self, tier: Tier) {
        self.classified += 1;
        *self.tiers.entry(tier).or_default() += 1;
    }
}

/// Per-candidate accuracy over classified items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub enabled: usize,
    pub correct: usize,
    pub accuracy: f64,
}

/// Contents of `summary.json`, recomputed from all partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Items in tier partitions
    pub total_items: usize,
    /// Items in the error partition
    pub error_items: usize,
    pub tiers: BTreeMap<String, usize>,
    pub candidates: BTreeMap<String, CandidateTally>,
    /// Tier counts grouped by the `question_type` extension
    #[serde(default)]
    pub by_question_type: BTreeMap<String, BTreeMap<String, usize>>,
    /// Times the summary has been recomputed for this directory
    pub runs: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    /// Build a summary from partition contents.
    ///
    /// `previous_runs` is the counter from an existing summary, if any.
    pub fn compute<'a>(
        classified: impl IntoIterator<Item = &'a FinalizedItem>,
        error_items: usize,
        previous_runs: Option<u64>,
    ) -> Self {
        let mut summary = Self {
            error_items,
            runs: previous_runs.unwrap_or(0) + 1,
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        for tier in Tier::ALL {
            summary.tiers.insert(tier.to_string(), 0);
        }

        for finalized in classified {
            let Some(tier) = finalized.tier() else {
                continue;
            };
            summary.total_items += 1;
            *summary.tiers.entry(tier.to_string()).or_default() += 1;

            let qtype = finalized
                .item
                .extension_str("question_type")
                .unwrap_or("unknown")
                .to_string();
            *summary
                .by_question_type
                .entry(qtype)
                .or_default()
                .entry(tier.to_string())
                .or_default() += 1;

            for (name, result) in &finalized.candidates {
                if !result.enabled {
                    continue;
                }
                let tally = summary.candidates.entry(name.clone()).or_default();
                tally.enabled += 1;
                if result.matches_ground_truth {
                    tally.correct += 1;
                }
            }
        }

        for tally in summary.candidates.values_mut() {
            tally.accuracy = if tally.enabled > 0 {
                tally.correct as f64 / tally.enabled as f64
            } else {
                0.0
            };
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateResult, Classification, QAItem, RoundValue};

    fn classified(id: &str, tier: Tier, matches: &[(&str, bool, bool)]) -> FinalizedItem {
        let item = QAItem::new(
            id,
            RoundValue::Single("q".to_string()),
            RoundValue::Single("a".to_string()),
        );
        let candidates = matches
            .iter()
            .map(|(name, enabled, ok)| {
                let mut r = CandidateResult::disabled(*name);
                r.enabled = *enabled;
                r.matches_ground_truth = *ok;
                r.answer = RoundValue::Single("x".to_string());
                (name.to_string(), r)
            })
            .collect();
        FinalizedItem::classified(
            item,
            candidates,
            Classification {
                tier,
                agreement_count: 0,
                enabled_count: 0,
                category: String::new(),
            },
        )
    }

    #[test]
    fn test_summary_counts_and_accuracy() {
        let items = vec![
            classified("a", Tier::Tier1, &[("m1", true, true), ("m2", true, true)]),
            classified("b", Tier::Tier3, &[("m1", true, true), ("m2", true, false)]),
            classified("c", Tier::Tier4, &[("m1", true, false), ("m2", false, false)]),
        ];

        let summary = RunSummary::compute(&items, 2, Some(4));
        assert_eq!(summary.total_items, 3);
        assert_eq!(summary.error_items, 2);
        assert_eq!(summary.runs, 5);
        assert_eq!(summary.tiers["tier1"], 1);
        assert_eq!(summary.tiers["tier2"], 0);
        assert_eq!(summary.by_question_type["unknown"]["tier3"], 1);

        let m1 = &summary.candidates["m1"];
        assert_eq!((m1.enabled, m1.correct), (3, 2));
        let m2 = &summary.candidates["m2"];
        assert_eq!((m2.enabled, m2.correct), (2, 1));
        assert!((m2.accuracy - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_first_summary_starts_at_one() {
        let summary = RunSummary::compute(std::iter::empty(), 0, None);
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.tiers.len(), 4);
    }
}
