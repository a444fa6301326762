//! `VisitorListCache` (§4.5): denormalised UX-facing per-signature view,
//! analogous to `SignatureAggregateCache` but path-ring-shaped and
//! grouped by visitor category rather than bot/human.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use uuid::Uuid;

const RECENT_PATHS_RING_SIZE: usize = 20;

/// Coarse visitor category used for filter counts (§4.5 "all/humans/
/// bots/ai/search/tools").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitorCategory {
    Human,
    Bot,
    Ai,
    Search,
    Tool,
}

/// One completed request fed into the visitor list (analogous to
/// `DetectionEvent` in the aggregate cache).
#[derive(Debug, Clone)]
pub struct VisitorEvent {
    pub signature: String,
    pub path: String,
    pub processing_time_ms: u64,
    pub request_id: Uuid,
    pub bot_type: Option<String>,
    pub bot_name: Option<String>,
    pub user_agent: String,
}

/// Denormalised per-signature UX view (§3 "CachedVisitor").
#[derive(Debug, Clone)]
pub struct CachedVisitor {
    pub signature: String,
    pub recent_paths: VecDeque<String>,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    pub current_processing_time_ms: u64,
    pub last_request_id: Uuid,
    pub bot_type: Option<String>,
    pub bot_name: Option<String>,
    pub category: VisitorCategory,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hit_count: u64,
}

impl CachedVisitor {
    fn new(event: &VisitorEvent, now: DateTime<Utc>) -> Self {
        let mut recent_paths = VecDeque::with_capacity(RECENT_PATHS_RING_SIZE);
        recent_paths.push_back(event.path.clone());
        let category = classify(event);

        Self {
            signature: event.signature.clone(),
            recent_paths,
            min_processing_time_ms: event.processing_time_ms,
            max_processing_time_ms: event.processing_time_ms,
            current_processing_time_ms: event.processing_time_ms,
            last_request_id: event.request_id,
            bot_type: event.bot_type.clone(),
            bot_name: event.bot_name.clone(),
            category,
            first_seen: now,
            last_seen: now,
            hit_count: 1,
        }
    }

    fn apply(&mut self, event: &VisitorEvent, now: DateTime<Utc>) {
        self.recent_paths.push_back(event.path.clone());
        while self.recent_paths.len() > RECENT_PATHS_RING_SIZE {
            self.recent_paths.pop_front();
        }
        self.min_processing_time_ms = self.min_processing_time_ms.min(event.processing_time_ms);
        self.max_processing_time_ms = self.max_processing_time_ms.max(event.processing_time_ms);
        self.current_processing_time_ms = event.processing_time_ms;
        self.last_request_id = event.request_id;
        if event.bot_type.is_some() {
            self.bot_type = event.bot_type.clone();
        }
        if event.bot_name.is_some() {
            self.bot_name = event.bot_name.clone();
        }
        // A real bot identity from detection always wins over heuristic
        // inference from path/UA patterns.
        if self.bot_type.is_none() {
            self.category = classify(event);
        }
        self.last_seen = now;
        self.hit_count += 1;
    }
}

/// Config-file, CMS, or exploit-probe path markers (§4.5 "bot-identity
/// inference ... based on path patterns").
const PROBE_PATH_MARKERS: &[&str] = &[
    "/wp-admin", "/wp-login", "/.env", "/.git", "/phpmyadmin", "/xmlrpc.php", "/admin.php", "/.aws", "/actuator",
];

const API_PATH_MARKERS: &[&str] = &["/api/", "/graphql", "/rest/"];

const SEARCH_UA_MARKERS: &[&str] = &["googlebot", "bingbot", "duckduckbot", "baiduspider", "yandexbot"];
const AI_UA_MARKERS: &[&str] = &["gptbot", "claudebot", "anthropic", "ccbot", "perplexitybot", "bytespider"];
const TOOL_UA_MARKERS: &[&str] = &["curl/", "python-requests", "go-http-client", "postmanruntime", "axios/"];

/// Heuristic bot-identity inference when detectors didn't supply a name:
/// known-bot UA regexes first, then path-pattern probes, else human.
fn classify(event: &VisitorEvent) -> VisitorCategory {
    let ua = event.user_agent.to_ascii_lowercase();
    if SEARCH_UA_MARKERS.iter().any(|m| ua.contains(m)) {
        return VisitorCategory::Search;
    }
    if AI_UA_MARKERS.iter().any(|m| ua.contains(m)) {
        return VisitorCategory::Ai;
    }
    if TOOL_UA_MARKERS.iter().any(|m| ua.contains(m)) {
        return VisitorCategory::Tool;
    }

    let path = event.path.to_ascii_lowercase();
    if PROBE_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        return VisitorCategory::Bot;
    }
    if API_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        return VisitorCategory::Tool;
    }

    VisitorCategory::Human
}

/// Filter counts by category (§4.5 "all/humans/bots/ai/search/tools").
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryCounts {
    pub all: u64,
    pub humans: u64,
    pub bots: u64,
    pub ai: u64,
    pub search: u64,
    pub tools: u64,
}

pub struct VisitorListCache {
    entries: DashMap<String, Mutex<CachedVisitor>>,
    max_entries: usize,
}

impl VisitorListCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn update_from_request(&self, event: &VisitorEvent, now: DateTime<Utc>) {
        match self.entries.get(&event.signature) {
            Some(slot) => slot.lock().apply(event, now),
            None => {
                self.entries.insert(event.signature.clone(), Mutex::new(CachedVisitor::new(event, now)));
            }
        }
        if self.entries.len() > self.max_entries + self.max_entries / 10 {
            self.evict_oldest();
        }
    }

    pub fn snapshot(&self, signature: &str) -> Option<CachedVisitor> {
        self.entries.get(signature).map(|slot| slot.lock().clone())
    }

    pub fn category_counts(&self) -> CategoryCounts {
        let mut counts = CategoryCounts::default();
        for entry in self.entries.iter() {
            let guard = entry.lock();
            counts.all += 1;
            match guard.category {
                VisitorCategory::Human => counts.humans += 1,
                VisitorCategory::Bot => counts.bots += 1,
                VisitorCategory::Ai => counts.ai += 1,
                VisitorCategory::Search => counts.search += 1,
                VisitorCategory::Tool => counts.tools += 1,
            }
        }
        counts
    }

    fn evict_oldest(&self) {
        let target = self.max_entries;
        let to_evict = self.entries.len().saturating_sub(target);
        if to_evict == 0 {
            return;
        }
        let mut by_age: Vec<(String, DateTime<Utc>)> = self.entries.iter().map(|e| (e.key().clone(), e.lock().last_seen)).collect();
        by_age.sort_by_key(|(_, last_seen)| *last_seen);
        for (signature, _) in by_age.into_iter().take(to_evict) {
            self.entries.remove(&signature);
        }
    }
}
