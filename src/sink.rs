//! `SignalSink` (§4.7, §5): a bounded, process-wide append-only ring of
//! elevated-salience signals kept around for learning feedback. Grounded
//! on the prompt cache's bounded-accounting shape
//! (`crate::llm::cache::{CacheStats, PromptCache}`), scaled down to a
//! single ring instead of a keyed map since signals here are anonymous
//! and retained purely by recency.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default values from §5.
pub const DEFAULT_MAX_SIGNAL_CAPACITY: usize = 10_000;
pub const DEFAULT_SIGNAL_RETENTION_MINUTES: i64 = 5;

/// One elevated-salience signal retained for learning feedback.
#[derive(Debug, Clone)]
pub struct RetainedSignal {
    pub signature: String,
    pub key: String,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded append-only ring, capacity `MaxSignalCapacity`, retention
/// `SignalRetentionMinutes`. Eviction discards oldest on overflow (§5).
/// The host is responsible for calling `sweep(now)` periodically to
/// enforce the TTL — there is no background task here, matching the
/// "constructor-injected singleton with explicit init/shutdown" shape
/// (§9 "Global mutable state").
pub struct SignalSink {
    entries: Mutex<VecDeque<RetainedSignal>>,
    capacity: usize,
    retention_minutes: i64,
}

impl SignalSink {
    pub fn new(capacity: usize, retention_minutes: i64) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            retention_minutes,
        }
    }

    /// Append one signal, dropping the oldest entry if at capacity.
    pub fn record(&self, signal: RetainedSignal) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(signal);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry older than `retention_minutes` relative to `now`.
    /// Host-driven: call this on a timer, not from the request path (§5
    /// "Back-pressure ... MUST NOT block the request path").
    pub fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::minutes(self.retention_minutes);
        let mut entries = self.entries.lock();
        while matches!(entries.front(), Some(entry) if entry.recorded_at < cutoff) {
            entries.pop_front();
        }
    }

    /// Snapshot of every currently-retained signal, oldest first.
    pub fn snapshot(&self) -> Vec<RetainedSignal> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for SignalSink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIGNAL_CAPACITY, DEFAULT_SIGNAL_RETENTION_MINUTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(sig: &str, offset_minutes: i64, base: DateTime<Utc>) -> RetainedSignal {
        RetainedSignal {
            signature: sig.to_string(),
            key: "waveform.burst_detected".to_string(),
            value: serde_json::json!(true),
            recorded_at: base + chrono::Duration::minutes(offset_minutes),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn records_accumulate_up_to_capacity() {
        let sink = SignalSink::new(3, 5);
        for i in 0..3 {
            sink.record(signal("sig1", i, now()));
        }
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn overflow_drops_oldest_entry() {
        let sink = SignalSink::new(2, 5);
        sink.record(signal("first", 0, now()));
        sink.record(signal("second", 1, now()));
        sink.record(signal("third", 2, now()));
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].signature, "second");
        assert_eq!(snapshot[1].signature, "third");
    }

    #[test]
    fn sweep_evicts_entries_older_than_retention_window() {
        let sink = SignalSink::new(100, 5);
        sink.record(signal("stale", -10, now()));
        sink.record(signal("fresh", 0, now()));
        sink.sweep(now());
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].signature, "fresh");
    }

    #[test]
    fn sweep_on_empty_sink_is_a_no_op() {
        let sink = SignalSink::default();
        sink.sweep(now());
        assert!(sink.is_empty());
    }
}
