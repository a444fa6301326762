//! The Evidence Aggregator (§4.3): fuses a detection ledger into a
//! calibrated probability, confidence, risk band, and primary bot identity.

use crate::blackboard::Blackboard;
use crate::detector::{Category, Contribution, Verdict};
use crate::ledger::DetectionLedger;
use crate::orchestrator::EarlyExitVerdict;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Blackboard keys considered salient enough to export into
/// `AggregatedEvidence::signals` (§3 Data Model), matching the examples in
/// `Blackboard`'s own doc comment.
pub const IMPORTANT_SIGNAL_KEYS: &[&str] = &["ua.is_bot", "ip.provider", "waveform.burst_detected"];

/// Discrete bucketisation of `botProbability`, used for policy and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskBand {
    VeryLow,
    Low,
    Elevated,
    Medium,
    High,
    VeryHigh,
    Unknown,
}

impl RiskBand {
    /// Boundaries round up: a probability exactly on a threshold takes the
    /// higher band (§8 boundary behaviours: `0.70 -> High`).
    pub fn from_probability(p: f64) -> Self {
        if p >= 0.85 {
            Self::VeryHigh
        } else if p >= 0.70 {
            Self::High
        } else if p >= 0.50 {
            Self::Medium
        } else if p >= 0.30 {
            Self::Elevated
        } else if p >= 0.15 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }

    /// Ordering for `RiskBandAtLeast` evidence-pattern transitions.
    fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::VeryLow => 1,
            Self::Low => 2,
            Self::Elevated => 3,
            Self::Medium => 4,
            Self::High => 5,
            Self::VeryHigh => 6,
        }
    }
}

/// A predicate over `AggregatedEvidence`, evaluated in declared order by a
/// detection policy's transitions to pick a `triggeredActionPolicyName`
/// (§4.3 step 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvidencePattern {
    PrimaryBotType(String),
    RiskBandAtLeast(RiskBand),
    EarlyExitVerdictIs(EarlyExitVerdict),
}

impl EvidencePattern {
    fn matches(&self, probability: f64, risk_band: RiskBand, primary_bot_type: &Option<String>, verdict: &Option<EarlyExitVerdict>) -> bool {
        let _ = probability;
        match self {
            Self::PrimaryBotType(expected) => primary_bot_type.as_deref() == Some(expected.as_str()),
            Self::RiskBandAtLeast(threshold) => risk_band.rank() >= threshold.rank(),
            Self::EarlyExitVerdictIs(expected) => verdict.as_ref() == Some(expected),
        }
    }
}

/// Per-category rollup of contributions (§4.3 step 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryScore {
    pub score: f64,
    pub contributors: Vec<String>,
}

/// Per-detector and per-category weight overrides a detection policy may
/// apply before aggregation (§4.3 step 1). Absent entries default to 1.0.
#[derive(Debug, Clone, Default)]
pub struct WeightOverrides {
    pub global: HashMap<String, f64>,
    pub category: HashMap<String, f64>,
    pub excluded_detectors: std::collections::HashSet<String>,
}

impl WeightOverrides {
    fn global_weight(&self, detector_name: &str) -> f64 {
        self.global.get(detector_name).copied().unwrap_or(1.0)
    }

    fn category_weight(&self, category: &Category) -> f64 {
        self.category.get(&category.to_string()).copied().unwrap_or(1.0)
    }

    fn is_excluded(&self, detector_name: &str) -> bool {
        self.excluded_detectors.contains(detector_name)
    }
}

/// Calibration constant for confidence: the sum of weights a "typical
/// complete" detector run is expected to contribute (§4.3 step 4).
pub const DEFAULT_CONFIDENCE_CALIBRATION: f64 = 4.0;

/// `k` in `p = 0.5 + 0.5 * tanh(k * S)`, chosen so a single maximal-delta,
/// unit-weight contribution (`S = 1.0`) saturates at `p = 0.9`
/// (`atanh(0.8)`, §4.3 step 2).
const SQUASH_K: f64 = 1.098_612_3;

/// Immutable per-request summary derived from a `DetectionLedger` (§3
/// "AggregatedEvidence").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvidence {
    pub bot_probability: f64,
    pub confidence: f64,
    pub risk_band: RiskBand,
    pub primary_bot_type: Option<String>,
    pub primary_bot_name: Option<String>,
    pub category_breakdown: HashMap<String, CategoryScore>,
    pub contributing_detectors: Vec<String>,
    pub early_exit: bool,
    pub early_exit_verdict: Option<EarlyExitVerdict>,
    pub total_processing_time_ms: u64,
    pub ai_ran: bool,
    pub policy_name: String,
    pub triggered_action_policy_name: Option<String>,
    /// The ledger this evidence was derived from, carried through so the
    /// response-feedback step can append its synthetic contribution.
    pub ledger: DetectionLedger,
    /// "Important" blackboard signals captured at aggregation time (§3
    /// Data Model), populated via `Blackboard::snapshot_filtered`.
    pub signals: HashMap<String, Value>,
    /// Set after action resolution (§4.4), which runs strictly after
    /// aggregation; `None` until `Engine::process` fills it in.
    pub policy_action: Option<String>,
}

/// Fuse a ledger (plus the orchestrator's early-exit metadata, the
/// request's blackboard, and any policy weight overrides) into
/// `AggregatedEvidence`. `transitions` are the owning detection policy's
/// evidence-pattern -> action-policy-name table, evaluated in order (§4.3
/// step 8).
#[allow(clippy::too_many_arguments)]
pub fn aggregate(
    ledger: &DetectionLedger,
    blackboard: &Blackboard,
    early_exit: bool,
    early_exit_verdict: Option<EarlyExitVerdict>,
    total_processing_time_ms: u64,
    overrides: &WeightOverrides,
    confidence_calibration: f64,
    policy_name: &str,
    transitions: &[(EvidencePattern, String)],
) -> AggregatedEvidence {
    let included: Vec<(&Contribution, f64)> = ledger
        .entries()
        .iter()
        .filter(|c| !overrides.is_excluded(&c.detector_name))
        .map(|c| {
            let eff_weight = c.weight * overrides.global_weight(&c.detector_name) * overrides.category_weight(&c.category);
            (c, eff_weight)
        })
        .collect();

    let total_weight: f64 = included.iter().map(|(_, w)| w).sum();
    let weighted_sum: f64 = included.iter().map(|(c, w)| w * c.confidence_delta).sum();
    let s = if total_weight > 0.0 { weighted_sum / total_weight } else { 0.0 };
    let mut probability = 0.5 + 0.5 * (SQUASH_K * s).tanh();

    let verified_good = included.iter().any(|(c, _)| c.verdict == Some(Verdict::VerifiedGoodBot));
    let verified_bad = included.iter().any(|(c, _)| c.verdict == Some(Verdict::VerifiedBadBot));

    let mut verdict = early_exit_verdict;
    if verified_good {
        probability = 0.0;
        verdict = Some(EarlyExitVerdict::VerifiedGoodBot);
    } else if verified_bad {
        probability = 1.0;
        verdict = Some(EarlyExitVerdict::VerifiedBadBot);
    }

    let risk_band = if verified_good {
        RiskBand::VeryLow
    } else if verified_bad {
        RiskBand::VeryHigh
    } else {
        RiskBand::from_probability(probability)
    };

    let confidence = if confidence_calibration > 0.0 {
        (total_weight / confidence_calibration).min(1.0)
    } else {
        0.0
    };

    let primary = included
        .iter()
        .filter(|(_, w)| *w > 0.0)
        .max_by(|(a, aw), (b, bw)| (aw * a.confidence_delta).total_cmp(&(bw * b.confidence_delta)));
    let (primary_bot_type, primary_bot_name) = primary
        .filter(|(c, w)| w * c.confidence_delta > 0.0)
        .map(|(c, _)| (c.bot_type.clone(), c.bot_name.clone()))
        .unwrap_or((None, None));

    let mut category_breakdown: HashMap<String, CategoryScore> = HashMap::new();
    for (c, w) in &included {
        let entry = category_breakdown.entry(c.category.to_string()).or_insert_with(|| CategoryScore {
            score: 0.0,
            contributors: Vec::new(),
        });
        entry.score += w * c.confidence_delta;
        entry.contributors.push(c.detector_name.clone());
    }

    let contributing_detectors: Vec<String> = included
        .iter()
        .filter(|(_, w)| *w > 0.0)
        .map(|(c, _)| c.detector_name.clone())
        .collect();

    let ai_ran = included.iter().any(|(c, _)| matches!(c.category, Category::Ai));

    let clamped_probability = probability.clamp(0.0, 1.0);
    let triggered_action_policy_name = transitions
        .iter()
        .find(|(pattern, _)| pattern.matches(clamped_probability, risk_band, &primary_bot_type, &verdict))
        .map(|(_, action_policy_name)| action_policy_name.clone());

    let signals: HashMap<String, Value> = blackboard
        .snapshot_filtered(IMPORTANT_SIGNAL_KEYS.iter().copied())
        .into_iter()
        .collect();

    AggregatedEvidence {
        bot_probability: clamped_probability,
        confidence: confidence.clamp(0.0, 1.0),
        risk_band,
        primary_bot_type,
        primary_bot_name,
        category_breakdown,
        contributing_detectors,
        early_exit,
        early_exit_verdict: verdict,
        total_processing_time_ms,
        ai_ran,
        policy_name: policy_name.to_string(),
        triggered_action_policy_name,
        ledger: ledger.clone(),
        signals,
        policy_action: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ledger_with(contributions: Vec<Contribution>) -> DetectionLedger {
        let mut ledger = DetectionLedger::new(Uuid::new_v4());
        for c in contributions {
            ledger.push(c);
        }
        ledger
    }

    #[test]
    fn known_good_ua_yields_low_risk() {
        let ledger = ledger_with(vec![Contribution::new("ua", Category::UserAgent, -0.4, 1.0, "known browser")]);
        let evidence = aggregate(&ledger, &Blackboard::new(), false, None, 5, &WeightOverrides::default(), DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        assert!(evidence.bot_probability < 0.35, "p={}", evidence.bot_probability);
        assert_eq!(evidence.risk_band, RiskBand::Low);
    }

    #[test]
    fn verified_bad_bot_forces_probability_one() {
        let ledger = ledger_with(vec![
            Contribution::new("ua", Category::UserAgent, 0.9, 1.5, "sqlmap").with_verdict(Verdict::VerifiedBadBot),
        ]);
        let evidence = aggregate(&ledger, &Blackboard::new(), true, Some(EarlyExitVerdict::VerifiedBadBot), 3, &WeightOverrides::default(), DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        assert_eq!(evidence.bot_probability, 1.0);
        assert_eq!(evidence.risk_band, RiskBand::VeryHigh);
    }

    #[test]
    fn verified_good_bot_forces_probability_zero_even_with_other_bad_evidence() {
        let ledger = ledger_with(vec![
            Contribution::new("ua", Category::UserAgent, 0.9, 1.0, "suspicious").with_verdict(Verdict::VerifiedGoodBot),
            Contribution::new("ip", Category::IpReputation, 0.8, 1.0, "flagged range"),
        ]);
        let evidence = aggregate(&ledger, &Blackboard::new(), true, Some(EarlyExitVerdict::VerifiedGoodBot), 3, &WeightOverrides::default(), DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        assert_eq!(evidence.bot_probability, 0.0);
        assert_eq!(evidence.risk_band, RiskBand::VeryLow);
    }

    #[test]
    fn risk_band_boundaries_round_up() {
        assert_eq!(RiskBand::from_probability(0.70), RiskBand::High);
        assert_eq!(RiskBand::from_probability(0.6999), RiskBand::Medium);
        assert_eq!(RiskBand::from_probability(0.85), RiskBand::VeryHigh);
    }

    #[test]
    fn excluded_detector_is_discarded_before_weighting() {
        let ledger = ledger_with(vec![
            Contribution::new("noisy", Category::Header, 0.9, 1.0, "noisy"),
            Contribution::new("ua", Category::UserAgent, -0.2, 1.0, "ok"),
        ]);
        let mut overrides = WeightOverrides::default();
        overrides.excluded_detectors.insert("noisy".to_string());
        let evidence = aggregate(&ledger, &Blackboard::new(), false, None, 1, &overrides, DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        assert_eq!(evidence.contributing_detectors, vec!["ua".to_string()]);
    }

    #[test]
    fn primary_bot_identity_picks_largest_positive_signed_weight() {
        let ledger = ledger_with(vec![
            Contribution::new("weak", Category::UserAgent, 0.2, 1.0, "weak signal").with_identity("tool", "curl"),
            Contribution::new("strong", Category::Behavioral, 0.9, 1.0, "strong signal").with_identity("scraper", "sqlmap"),
        ]);
        let evidence = aggregate(&ledger, &Blackboard::new(), false, None, 1, &WeightOverrides::default(), DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        assert_eq!(evidence.primary_bot_name.as_deref(), Some("sqlmap"));
    }

    #[test]
    fn confidence_is_capped_at_one() {
        let ledger = ledger_with(vec![
            Contribution::new("a", Category::UserAgent, 0.1, 10.0, "r"),
            Contribution::new("b", Category::Header, 0.1, 10.0, "r"),
        ]);
        let evidence = aggregate(&ledger, &Blackboard::new(), false, None, 1, &WeightOverrides::default(), DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        assert_eq!(evidence.confidence, 1.0);
    }

    #[test]
    fn category_breakdown_groups_by_category_not_normalised() {
        let ledger = ledger_with(vec![
            Contribution::new("a", Category::UserAgent, 0.5, 1.0, "r"),
            Contribution::new("b", Category::UserAgent, 0.3, 1.0, "r"),
        ]);
        let evidence = aggregate(&ledger, &Blackboard::new(), false, None, 1, &WeightOverrides::default(), DEFAULT_CONFIDENCE_CALIBRATION, "default", &[]);
        let ua = evidence.category_breakdown.get("UserAgent").unwrap();
        assert!((ua.score - 0.8).abs() < 1e-9);
        assert_eq!(ua.contributors.len(), 2);
    }
}
