//! The per-request blackboard: a string-keyed signal store shared among
//! detectors within one request.
//!
//! Signals are monotone-write per request: detectors may add, rarely
//! overwrite. Reads are lock-free; writes are last-writer-wins but
//! detectors are required to be content-deterministic given identical
//! inputs, so the ordering ambiguity within a wave is acceptable (§4.1).

use dashmap::DashMap;
use serde_json::Value;

/// A per-request key-value signal store. Keys are stable dotted-namespace
/// identifiers, e.g. `ua.is_bot`, `ip.provider`, `waveform.burst_detected`.
#[derive(Debug, Default)]
pub struct Blackboard {
    signals: DashMap<String, Value>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a signal. Last writer wins; see module docs for why this is
    /// safe given the detector contract.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.signals.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.signals.get(key).map(|v| v.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.signals.contains_key(key)
    }

    /// Lock-free snapshot of every signal currently on the board. Used to
    /// populate `AggregatedEvidence::signals` with "important" entries.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.signals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshot filtered to a set of well-known keys considered salient
    /// enough to export into `AggregatedEvidence`.
    pub fn snapshot_filtered<'a>(&self, important: impl IntoIterator<Item = &'a str>) -> Vec<(String, Value)> {
        important
            .into_iter()
            .filter_map(|key| self.get(key).map(|v| (key.to_string(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let board = Blackboard::new();
        board.set("ua.is_bot", true);
        assert_eq!(board.get("ua.is_bot"), Some(Value::from(true)));
        assert!(board.has("ua.is_bot"));
        assert!(!board.has("ip.provider"));
    }

    #[test]
    fn last_writer_wins() {
        let board = Blackboard::new();
        board.set("k", 1);
        board.set("k", 2);
        assert_eq!(board.get("k"), Some(Value::from(2)));
    }

    #[test]
    fn snapshot_filtered_skips_absent_keys() {
        let board = Blackboard::new();
        board.set("ua.is_bot", true);
        let filtered = board.snapshot_filtered(["ua.is_bot", "ip.provider"]);
        assert_eq!(filtered, vec![("ua.is_bot".to_string(), Value::from(true))]);
    }
}
