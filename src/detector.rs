//! The detector contract (§4.2): every detector implements this trait and
//! contributes an opinion about one request to the blackboard orchestrator.

use crate::blackboard::Blackboard;
use crate::envelope::RequestEnvelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Coarse grouping used for category weighting and breakdown (§4.3 step 7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    UserAgent,
    Header,
    IpReputation,
    Behavioral,
    Fingerprint,
    Correlation,
    Ai,
    Custom(String),
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserAgent => write!(f, "UserAgent"),
            Self::Header => write!(f, "Header"),
            Self::IpReputation => write!(f, "IpReputation"),
            Self::Behavioral => write!(f, "Behavioral"),
            Self::Fingerprint => write!(f, "Fingerprint"),
            Self::Correlation => write!(f, "Correlation"),
            Self::Ai => write!(f, "Ai"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// A short-circuit verdict a detector can attach to a contribution. Honored
/// immediately at any wave boundary (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    VerifiedGoodBot,
    VerifiedBadBot,
    Whitelisted,
}

/// One detector's signed, weighted, reasoned opinion about one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub detector_name: String,
    pub category: Category,
    /// In `[-1, 1]`; negative = human-like. Clamped by the aggregator.
    pub confidence_delta: f64,
    /// `>= 0`.
    pub weight: f64,
    pub reason: String,
    pub processing_time_ms: u64,
    pub priority: i32,
    pub verdict: Option<Verdict>,
    pub bot_type: Option<String>,
    pub bot_name: Option<String>,
}

impl Contribution {
    pub fn new(detector_name: impl Into<String>, category: Category, confidence_delta: f64, weight: f64, reason: impl Into<String>) -> Self {
        Self {
            detector_name: detector_name.into(),
            category,
            confidence_delta: confidence_delta.clamp(-1.0, 1.0),
            weight: weight.max(0.0),
            reason: reason.into(),
            processing_time_ms: 0,
            priority: 0,
            verdict: None,
            bot_type: None,
            bot_name: None,
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_identity(mut self, bot_type: impl Into<String>, bot_name: impl Into<String>) -> Self {
        self.bot_type = Some(bot_type.into());
        self.bot_name = Some(bot_name.into());
        self
    }

    pub fn with_processing_time_ms(mut self, ms: u64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// `effWeight * delta`, used by the aggregator to rank primary bot
    /// identity and by the orchestrator's synthetic contribution builder.
    pub fn signed_weight(&self) -> f64 {
        self.weight * self.confidence_delta
    }
}

/// Which integer wave (1..N) a detector runs in. Detectors in the same
/// wave run in parallel; waves run strictly in sequence.
pub type Wave = u32;

/// Stable per-detector metadata the orchestrator needs before invocation.
#[derive(Debug, Clone)]
pub struct DetectorMeta {
    pub name: String,
    pub category: Category,
    pub wave: Wave,
    pub default_weight: f64,
    pub expected_latency_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

/// Every detector exposes stable identity plus `contribute`.
///
/// Contract (§4.2):
/// - MUST be cancellation-cooperative.
/// - MUST NOT mutate the request envelope.
/// - MAY read/write signals on the blackboard.
/// - SHOULD return `Ok(None)` for "no opinion"; the aggregator treats
///   absence as neutral, not human-like.
#[async_trait]
pub trait Detector: Send + Sync {
    fn meta(&self) -> &DetectorMeta;

    async fn contribute(
        &self,
        envelope: &RequestEnvelope,
        blackboard: &Blackboard,
        cancel: &CancellationToken,
    ) -> crate::error::Result<Option<Contribution>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_delta_clamps_to_unit_interval() {
        let c = Contribution::new("x", Category::UserAgent, 5.0, 1.0, "r");
        assert_eq!(c.confidence_delta, 1.0);
        let c = Contribution::new("x", Category::UserAgent, -5.0, 1.0, "r");
        assert_eq!(c.confidence_delta, -1.0);
    }

    #[test]
    fn weight_clamps_to_non_negative() {
        let c = Contribution::new("x", Category::UserAgent, 0.1, -2.0, "r");
        assert_eq!(c.weight, 0.0);
    }

    #[test]
    fn signed_weight_multiplies_weight_and_delta() {
        let c = Contribution::new("x", Category::UserAgent, 0.5, 2.0, "r");
        assert_eq!(c.signed_weight(), 1.0);
    }
}
