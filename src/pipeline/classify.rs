//! Difficulty classification from candidate agreement.
//!
//! K_i: Pure and deterministic; disabled candidates never count.

use crate::models::{CandidateResult, Classification, Tier};
use std::collections::BTreeMap;

/// Tier for an agreement count.
pub fn tier_for(agreement_count: usize) -> Tier {
    match agreement_count {
        0 => Tier::Tier4,
        1 => Tier::Tier3,
        2 => Tier::Tier2,
        _ => Tier::Tier1,
    }
}

fn category(tier: Tier, agreement_count: usize, enabled_count: usize) -> String {
    if enabled_count == 0 {
        return "no enabled candidates".to_string();
    }
    let label = match tier {
        Tier::Tier1 => "easy",
        Tier::Tier2 => "moderate",
        Tier::Tier3 => "hard",
        Tier::Tier4 => "unsolved",
    };
    format!("{label} ({agreement_count}/{enabled_count} correct)")
}

/// Classify an item from its judged candidate results.
pub fn classify(results: &BTreeMap<String, CandidateResult>, enabled_count: usize) -> Classification {
    if enabled_count == 0 {
        return Classification {
            tier: Tier::Tier4,
            agreement_count: 0,
            enabled_count: 0,
            category: category(Tier::Tier4, 0, 0),
        };
    }

    let agreement_count = results
        .values()
        .filter(|r| r.enabled && r.matches_ground_truth)
        .count();
    let tier = tier_for(agreement_count);

    Classification {
        tier,
        agreement_count,
        enabled_count,
        category: category(tier, agreement_count, enabled_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoundValue;

    fn results(flags: &[(&str, bool, bool)]) -> BTreeMap<String, CandidateResult> {
        flags
            .iter()
            .map(|(name, enabled, ok)| {
                let mut r = CandidateResult::disabled(*name);
                r.enabled = *enabled;
                r.answer = RoundValue::Single("x".to_string());
                r.matches_ground_truth = *ok;
                (name.to_string(), r)
            })
            .collect()
    }

    #[test]
    fn test_all_agree_is_tier1() {
        let c = classify(
            &results(&[("a", true, true), ("b", true, true), ("c", true, true)]),
            3,
        );
        assert_eq!(c.tier, Tier::Tier1);
        assert_eq!(c.agreement_count, 3);
        assert_eq!(c.category, "easy (3/3 correct)");
    }

    #[test]
    fn test_single_agreement_is_tier3() {
        let c = classify(
            &results(&[("a", true, false), ("b", true, true), ("c", true, false)]),
            3,
        );
        assert_eq!(c.tier, Tier::Tier3);
        assert_eq!(c.agreement_count, 1);
    }

    #[test]
    fn test_disabled_candidates_do_not_count() {
        let c = classify(
            &results(&[("a", true, true), ("b", true, true), ("c", false, true)]),
            2,
        );
        assert_eq!(c.tier, Tier::Tier2);
        assert_eq!(c.agreement_count, 2);
        assert_eq!(c.enabled_count, 2);
    }

    #[test]
    fn test_no_enabled_candidates() {
        let c = classify(&results(&[("a", false, false)]), 0);
        assert_eq!(c.tier, Tier::Tier4);
        assert_eq!(c.category, "no enabled candidates");
    }

    #[test]
    fn test_tier_mapping() {
        assert_eq!(tier_for(0), Tier::Tier4);
        assert_eq!(tier_for(1), Tier::Tier3);
        assert_eq!(tier_for(2), Tier::Tier2);
        assert_eq!(tier_for(3), Tier::Tier1);
        assert_eq!(tier_for(7), Tier::Tier1);
    }
}
