//! `SignatureAggregateCache` (§3 "SignatureAggregate", §4.5): write-through
//! LFU cache of per-signature detection history, keyed by primary
//! signature. Grounded on the prompt cache's entry/stats split
//! (`crate::llm::cache::{CacheEntry, PromptCache}`), scaled to a
//! per-entry-lock ring-buffer shape.

use crate::aggregator::RiskBand;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default ring-buffer length for rolling probability/confidence/timing
/// history (§3: "default N=20").
pub const DEFAULT_SCORE_HISTORY_SIZE: usize = 20;

/// Entries with `hit_count` above this are skipped by eviction unless no
/// cooler candidate remains (§4.5 "Eviction skips hot entries").
const HOT_HIT_COUNT_THRESHOLD: u64 = 50;

/// Event fed in from one completed detection (§4.5 `updateFromDetection`).
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub signature: String,
    pub probability: f64,
    pub confidence: f64,
    pub risk_band: RiskBand,
    pub action: String,
    pub country_code: Option<String>,
    pub processing_time_ms: u64,
    pub bot_type: Option<String>,
    pub bot_name: Option<String>,
}

/// Per-signature state, guarded by its own lock (§3 "guarded by a
/// per-entry lock; reads may return a consistent snapshot copy").
#[derive(Debug, Clone)]
pub struct SignatureAggregate {
    pub signature: String,
    pub hit_count: u64,
    pub access_count: u64,
    pub probability_history: VecDeque<f64>,
    pub confidence_history: VecDeque<f64>,
    pub processing_time_history: VecDeque<u64>,
    pub risk_band: RiskBand,
    pub probability: f64,
    pub confidence: f64,
    pub action: String,
    pub country_code: Option<String>,
    pub processing_time_ms: u64,
    pub bot_type: Option<String>,
    pub bot_name: Option<String>,
    pub narrative: Option<String>,
    pub description: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SignatureAggregate {
    fn new(event: &DetectionEvent, now: DateTime<Utc>, history_size: usize) -> Self {
        let mut probability_history = VecDeque::with_capacity(history_size);
        probability_history.push_back(event.probability);
        let mut confidence_history = VecDeque::with_capacity(history_size);
        confidence_history.push_back(event.confidence);
        let mut processing_time_history = VecDeque::with_capacity(history_size);
        processing_time_history.push_back(event.processing_time_ms);

        Self {
            signature: event.signature.clone(),
            hit_count: 1,
            access_count: 1,
            probability_history,
            confidence_history,
            processing_time_history,
            risk_band: event.risk_band,
            probability: event.probability,
            confidence: event.confidence,
            action: event.action.clone(),
            country_code: event.country_code.clone(),
            processing_time_ms: event.processing_time_ms,
            bot_type: event.bot_type.clone(),
            bot_name: event.bot_name.clone(),
            narrative: None,
            description: None,
            first_seen: now,
            last_seen: now,
        }
    }

    fn apply(&mut self, event: &DetectionEvent, now: DateTime<Utc>, history_size: usize) {
        self.hit_count += 1;
        self.access_count += 1;
        push_bounded(&mut self.probability_history, event.probability, history_size);
        push_bounded(&mut self.confidence_history, event.confidence, history_size);
        push_bounded(&mut self.processing_time_history, event.processing_time_ms, history_size);
        self.risk_band = event.risk_band;
        self.probability = event.probability;
        self.confidence = event.confidence;
        self.action = event.action.clone();
        if event.country_code.is_some() {
            self.country_code = event.country_code.clone();
        }
        self.processing_time_ms = event.processing_time_ms;
        if event.bot_type.is_some() {
            self.bot_type = event.bot_type.clone();
        }
        if event.bot_name.is_some() {
            self.bot_name = event.bot_name.clone();
        }
        self.last_seen = now;
    }

    fn is_bot(&self) -> bool {
        self.bot_type.is_some() || matches!(self.risk_band, RiskBand::High | RiskBand::VeryHigh)
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, value: T, cap: usize) {
    ring.push_back(value);
    while ring.len() > cap {
        ring.pop_front();
    }
}

/// A point-in-time view of a bot entry for the `topBots` listing.
#[derive(Debug, Clone)]
pub struct BotSummary {
    pub signature: String,
    pub hit_count: u64,
    pub last_seen: DateTime<Utc>,
    pub country_code: Option<String>,
    pub probability: f64,
    pub bot_name: Option<String>,
}

/// Sort order for `topBots` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopBotsSort {
    HitsDesc,
    Name,
    LastSeen,
    Country,
    Probability,
}

struct SortedView {
    dirty: AtomicBool,
    bots: Mutex<Vec<BotSummary>>,
}

/// Write-through LFU cache of `SignatureAggregate`s, keyed by primary
/// signature (§4.5 `SignatureAggregateCache`).
pub struct SignatureAggregateCache {
    entries: DashMap<String, Mutex<SignatureAggregate>>,
    max_entries: usize,
    history_size: usize,
    sorted_view: SortedView,
}

impl SignatureAggregateCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_history_size(max_entries, DEFAULT_SCORE_HISTORY_SIZE)
    }

    pub fn with_history_size(max_entries: usize, history_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            history_size,
            sorted_view: SortedView {
                dirty: AtomicBool::new(false),
                bots: Mutex::new(Vec::new()),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upsert by primary signature, pushing history and marking the
    /// sorted view dirty, then run batched eviction if over budget
    /// (§4.5 `updateFromDetection`).
    pub fn update_from_detection(&self, event: &DetectionEvent, now: DateTime<Utc>) {
        match self.entries.get(&event.signature) {
            Some(slot) => slot.lock().apply(event, now, self.history_size),
            None => {
                self.entries
                    .insert(event.signature.clone(), Mutex::new(SignatureAggregate::new(event, now, self.history_size)));
            }
        }
        self.sorted_view.dirty.store(true, Ordering::Release);

        let overflow_threshold = self.max_entries + self.max_entries / 10;
        if self.entries.len() > overflow_threshold {
            self.evict_batch();
        }
    }

    /// Periodic LFU-starvation guard: halve every entry's `access_count`.
    pub fn halve_access_counts(&self) {
        for entry in self.entries.iter() {
            entry.lock().access_count /= 2;
        }
    }

    /// Latest-wins writeback from async bot-name enrichment (§4.5
    /// `applyBotName`).
    pub fn apply_bot_name(&self, signature: &str, name: impl Into<String>, description: Option<String>) {
        if let Some(slot) = self.entries.get(signature) {
            let mut entry = slot.lock();
            entry.bot_name = Some(name.into());
            if description.is_some() {
                entry.description = description;
            }
        }
        self.sorted_view.dirty.store(true, Ordering::Release);
    }

    /// Idempotent initial population (§4.5 `seed`).
    pub fn seed(&self, bots: impl IntoIterator<Item = DetectionEvent>, now: DateTime<Utc>) {
        for event in bots {
            self.update_from_detection(&event, now);
        }
    }

    /// Copy of the probability ring under the per-entry lock (§4.5
    /// `sparkline`).
    pub fn sparkline(&self, signature: &str) -> Option<Vec<f64>> {
        self.entries.get(signature).map(|slot| slot.lock().probability_history.iter().copied().collect())
    }

    pub fn snapshot(&self, signature: &str) -> Option<SignatureAggregate> {
        self.entries.get(signature).map(|slot| slot.lock().clone())
    }

    /// Paginated, sorted snapshot of bot entries only (§4.5 `topBots`).
    /// Uses double-checked locking on the dirty flag: readers rebuild the
    /// sorted view only if it is stale, and otherwise never block behind
    /// the eviction loop.
    pub fn top_bots(&self, page: usize, page_size: usize, sort: TopBotsSort, filter_country: Option<&str>) -> Vec<BotSummary> {
        if self.sorted_view.dirty.swap(false, Ordering::AcqRel) {
            let mut rebuilt: Vec<BotSummary> = self
                .entries
                .iter()
                .filter_map(|entry| {
                    let guard = entry.lock();
                    guard.is_bot().then(|| BotSummary {
                        signature: guard.signature.clone(),
                        hit_count: guard.hit_count,
                        last_seen: guard.last_seen,
                        country_code: guard.country_code.clone(),
                        probability: guard.probability,
                        bot_name: guard.bot_name.clone(),
                    })
                })
                .collect();
            sort_bots(&mut rebuilt, sort);
            *self.sorted_view.bots.lock() = rebuilt;
        }

        let bots = self.sorted_view.bots.lock();
        bots.iter()
            .filter(|b| filter_country.is_none_or(|c| b.country_code.as_deref() == Some(c)))
            .skip(page * page_size)
            .take(page_size)
            .cloned()
            .collect()
    }

    /// Batched eviction of the coolest entries, skipping hot ones unless
    /// no cooler candidate remains (§4.5).
    fn evict_batch(&self) {
        let target = self.max_entries;
        let to_evict = self.entries.len().saturating_sub(target);
        if to_evict == 0 {
            return;
        }

        let mut candidates: Vec<(String, u64, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|entry| {
                let guard = entry.lock();
                (guard.signature.clone(), guard.access_count, guard.last_seen)
            })
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut cool: Vec<&(String, u64, DateTime<Utc>)> = candidates.iter().filter(|(_, access, _)| *access <= HOT_HIT_COUNT_THRESHOLD).collect();
        if cool.len() < to_evict {
            cool = candidates.iter().collect();
        }

        for (signature, _, _) in cool.into_iter().take(to_evict) {
            self.entries.remove(signature);
        }
        self.sorted_view.dirty.store(true, Ordering::Release);
    }
}

fn sort_bots(bots: &mut [BotSummary], sort: TopBotsSort) {
    match sort {
        TopBotsSort::HitsDesc => bots.sort_by_key(|b| std::cmp::Reverse(b.hit_count)),
        TopBotsSort::Name => bots.sort_by(|a, b| a.bot_name.cmp(&b.bot_name)),
        TopBotsSort::LastSeen => bots.sort_by_key(|b| std::cmp::Reverse(b.last_seen)),
        TopBotsSort::Country => bots.sort_by(|a, b| a.country_code.cmp(&b.country_code)),
        TopBotsSort::Probability => bots.sort_by(|a, b| b.probability.partial_cmp(&a.probability).unwrap_or(std::cmp::Ordering::Equal)),
    }
}

pub type SharedSignatureAggregateCache = Arc<SignatureAggregateCache>;
