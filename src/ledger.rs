//! The detection ledger: an append-only list of contributions for one
//! request (§3 "DetectionLedger").

use crate::detector::{Category, Contribution};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only list of contributions for one request. Not mutated after
/// aggregation except by the response-feedback step, which appends one
/// synthetic contribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionLedger {
    pub request_id: Option<Uuid>,
    entries: Vec<Contribution>,
}

impl DetectionLedger {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id: Some(request_id),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, contribution: Contribution) {
        self.entries.push(contribution);
    }

    pub fn entries(&self) -> &[Contribution] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contributing_detector_names(&self) -> Vec<String> {
        self.entries.iter().map(|c| c.detector_name.clone()).collect()
    }

    /// Append the synthetic "ResponseStatusBoost" contribution used by the
    /// response-feedback path (§4.7). This is the one mutation allowed
    /// after aggregation.
    pub fn push_response_status_boost(&mut self, delta: f64, reason: impl Into<String>) {
        self.push(Contribution::new(
            "ResponseStatusBoost",
            Category::Behavioral,
            delta,
            1.0,
            reason,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Category;

    #[test]
    fn ledger_accumulates_entries_in_order() {
        let mut ledger = DetectionLedger::new(Uuid::new_v4());
        ledger.push(Contribution::new("a", Category::UserAgent, 0.1, 1.0, "r1"));
        ledger.push(Contribution::new("b", Category::Behavioral, 0.2, 1.0, "r2"));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.contributing_detector_names(), vec!["a", "b"]);
    }

    #[test]
    fn response_status_boost_is_a_synthetic_entry() {
        let mut ledger = DetectionLedger::new(Uuid::new_v4());
        ledger.push_response_status_boost(0.15, "Response 404 Not Found on /missing");
        assert_eq!(ledger.entries()[0].detector_name, "ResponseStatusBoost");
    }
}
