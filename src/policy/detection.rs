//! Detection-policy resolution (§4.4): request -> detector set, weights,
//! thresholds.

use crate::aggregator::{EvidencePattern, WeightOverrides};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};

/// A named bundle of detectors, weights, and thresholds (§3
/// "DetectionPolicy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPolicy {
    pub name: String,
    pub detector_names: Vec<String>,
    pub category_weights: HashMap<String, f64>,
    pub global_weights: HashMap<String, f64>,
    pub excluded_detectors: HashSet<String>,
    pub immediate_block_threshold: f64,
    pub min_confidence: f64,
    pub action_policy_overridable: bool,
    /// Evidence pattern -> action-policy name, evaluated in order (§4.3
    /// step 8).
    pub transitions: Vec<(EvidencePattern, String)>,
}

impl DetectionPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detector_names: Vec::new(),
            category_weights: HashMap::new(),
            global_weights: HashMap::new(),
            excluded_detectors: HashSet::new(),
            immediate_block_threshold: 0.85,
            min_confidence: 0.3,
            action_policy_overridable: true,
            transitions: Vec::new(),
        }
    }

    /// The "static" built-in policy (§4.4 "Static-asset short-circuit"): a
    /// minimal detector set and high thresholds for requests that resolve
    /// to a static asset by path extension.
    pub fn static_asset() -> Self {
        let mut policy = Self::new("static");
        policy.detector_names = vec!["UserAgent".to_string()];
        policy.immediate_block_threshold = 0.98;
        policy.min_confidence = 0.8;
        policy
    }

    pub fn weight_overrides(&self) -> WeightOverrides {
        WeightOverrides {
            global: self.global_weights.clone(),
            category: self.category_weights.clone(),
            excluded_detectors: self.excluded_detectors.clone(),
        }
    }
}

/// An API-key overlay: an excluded-detector-set union and weight overrides
/// applied on top of a resolved policy, plus an optional named policy
/// override (§4.4 resolution step 4).
#[derive(Debug, Clone, Default)]
pub struct ApiKeyOverlay {
    pub policy_name: Option<String>,
    pub excluded_detectors: HashSet<String>,
    pub global_weights: HashMap<String, f64>,
}

/// A single `/prefix/*` or `/prefix/**` path-glob entry, pre-compiled once
/// at construction — the same "compile the table once, classify by first
/// match" shape as a query-pattern classifier.
#[derive(Debug, Clone)]
struct PathRule {
    source: String,
    pattern: Regex,
    policy_name: String,
}

fn glob_to_regex(glob: &str) -> Option<Regex> {
    let lower = glob.to_ascii_lowercase();
    let (prefix, pattern) = if let Some(p) = lower.strip_suffix("/**") {
        (p, format!("^{}(/.*)?$", regex::escape(p)))
    } else if let Some(p) = lower.strip_suffix("/*") {
        (p, format!("^{}/[^/]+$", regex::escape(p)))
    } else {
        (lower.as_str(), format!("^{}$", regex::escape(&lower)))
    };
    let _ = prefix;
    Regex::new(&pattern).ok()
}

/// Path -> detection-policy-name routing table, resolved in declared
/// precedence: exact, `/prefix/*`, `/prefix/**`, plain prefix.
#[derive(Debug, Clone)]
pub struct PathPolicyMap {
    exact: HashMap<String, String>,
    globs: Vec<PathRule>,
    prefixes: Vec<(String, String)>,
    pub default_policy_name: String,
}

impl PathPolicyMap {
    pub fn new(default_policy_name: impl Into<String>) -> Self {
        Self {
            exact: HashMap::new(),
            globs: Vec::new(),
            prefixes: Vec::new(),
            default_policy_name: default_policy_name.into(),
        }
    }

    pub fn with_exact(mut self, path: impl Into<String>, policy_name: impl Into<String>) -> Self {
        self.exact.insert(path.into().to_ascii_lowercase(), policy_name.into());
        self
    }

    /// Accepts `/prefix/*`, `/prefix/**`, or a plain prefix string.
    pub fn with_path_policy(mut self, glob: impl Into<String>, policy_name: impl Into<String>) -> Self {
        let glob = glob.into();
        let policy_name = policy_name.into();
        if glob.ends_with("/*") || glob.ends_with("/**") {
            if let Some(pattern) = glob_to_regex(&glob) {
                self.globs.push(PathRule { source: glob, pattern, policy_name });
            }
        } else {
            self.prefixes.push((glob.to_ascii_lowercase(), policy_name));
        }
        self
    }

    pub fn resolve(&self, path: &str) -> &str {
        let lower = path.to_ascii_lowercase();
        if let Some(name) = self.exact.get(&lower) {
            return name;
        }
        for rule in &self.globs {
            if rule.pattern.is_match(&lower) {
                return &rule.policy_name;
            }
        }
        for (prefix, name) in &self.prefixes {
            if lower.starts_with(prefix.as_str()) {
                return name;
            }
        }
        &self.default_policy_name
    }
}

/// Wire format for `PathPolicyMap`: the source glob strings rather than
/// compiled `Regex`, recompiled on deserialize (§6 "deserialised from any
/// configuration source").
#[derive(Serialize, Deserialize)]
struct PathPolicyMapWire {
    exact: HashMap<String, String>,
    globs: Vec<(String, String)>,
    prefixes: Vec<(String, String)>,
    default_policy_name: String,
}

impl Serialize for PathPolicyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = PathPolicyMapWire {
            exact: self.exact.clone(),
            globs: self.globs.iter().map(|r| (r.source.clone(), r.policy_name.clone())).collect(),
            prefixes: self.prefixes.clone(),
            default_policy_name: self.default_policy_name.clone(),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PathPolicyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = PathPolicyMapWire::deserialize(deserializer)?;
        let mut map = PathPolicyMap::new(wire.default_policy_name);
        map.exact = wire.exact;
        map.prefixes = wire.prefixes;
        for (glob, policy_name) in wire.globs {
            map = map.with_path_policy(glob, policy_name);
        }
        Ok(map)
    }
}

/// Static-asset-by-extension check (§4.4). Content-type based detection is
/// handled out-of-band by the response-feedback path; see DESIGN.md.
pub fn is_static_asset_path(path: &str, extensions: &HashSet<String>) -> bool {
    let lower_path = path.to_ascii_lowercase();
    match lower_path.rsplit_once('.') {
        Some((_, ext)) => extensions.contains(&format!(".{ext}")),
        None => false,
    }
}

/// Everything needed to resolve a detection policy for one request, in
/// declared precedence order (§4.4, highest first):
/// 1. test-mode explicit override
/// 2. route-attribute metadata
/// 3. sandbox/probation policy
/// 4. API-key overlay explicit policy name
/// 5. path -> policy map
/// 6. default policy
pub struct DetectionPolicyResolution<'a> {
    pub test_mode_enabled: bool,
    pub test_mode_override: Option<&'a str>,
    pub route_attribute_policy: Option<&'a str>,
    pub sandbox_policy: Option<&'a str>,
    pub api_key_overlay: Option<&'a ApiKeyOverlay>,
    pub path: &'a str,
    pub path_policy_map: &'a PathPolicyMap,
}

pub fn resolve_policy_name(resolution: &DetectionPolicyResolution<'_>) -> String {
    if resolution.test_mode_enabled {
        if let Some(name) = resolution.test_mode_override {
            return name.to_string();
        }
    }
    if let Some(name) = resolution.route_attribute_policy {
        return name.to_string();
    }
    if let Some(name) = resolution.sandbox_policy {
        return name.to_string();
    }
    if let Some(overlay) = resolution.api_key_overlay {
        if let Some(name) = &overlay.policy_name {
            return name.clone();
        }
    }
    resolution.path_policy_map.resolve(resolution.path).to_string()
}

/// Apply an API-key overlay's excluded-detector union and weight overrides
/// on top of a resolved policy, but only when permitted (§4.4: "but only
/// if the policy is actionPolicyOverridable or the overlay targets
/// detection only").
pub fn apply_overlay(policy: &mut DetectionPolicy, overlay: &ApiKeyOverlay, overlay_targets_detection_only: bool) {
    if !policy.action_policy_overridable && !overlay_targets_detection_only {
        return;
    }
    policy.excluded_detectors.extend(overlay.excluded_detectors.iter().cloned());
    for (detector, weight) in &overlay.global_weights {
        policy.global_weights.insert(detector.clone(), *weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_glob_and_prefix() {
        let map = PathPolicyMap::new("default")
            .with_exact("/login", "strict")
            .with_path_policy("/login/*", "glob-policy")
            .with_path_policy("/lo", "prefix-policy");
        assert_eq!(map.resolve("/login"), "strict");
    }

    #[test]
    fn single_segment_glob_does_not_match_nested_path() {
        let map = PathPolicyMap::new("default").with_path_policy("/api/*", "api-policy");
        assert_eq!(map.resolve("/api/users"), "api-policy");
        assert_eq!(map.resolve("/api/users/1"), "default");
    }

    #[test]
    fn recursive_glob_matches_nested_path() {
        let map = PathPolicyMap::new("default").with_path_policy("/api/**", "api-policy");
        assert_eq!(map.resolve("/api/users/1/edit"), "api-policy");
    }

    #[test]
    fn plain_prefix_matches_case_insensitively() {
        let map = PathPolicyMap::new("default").with_path_policy("/admin", "admin-policy");
        assert_eq!(map.resolve("/ADMIN/dashboard"), "admin-policy");
    }

    #[test]
    fn falls_back_to_default_when_nothing_matches() {
        let map = PathPolicyMap::new("default");
        assert_eq!(map.resolve("/anything"), "default");
    }

    #[test]
    fn resolution_precedence_prefers_route_attribute_over_path_map() {
        let map = PathPolicyMap::new("default").with_path_policy("/api", "api-policy");
        let resolution = DetectionPolicyResolution {
            test_mode_enabled: false,
            test_mode_override: None,
            route_attribute_policy: Some("route-policy"),
            sandbox_policy: None,
            api_key_overlay: None,
            path: "/api/widgets",
            path_policy_map: &map,
        };
        assert_eq!(resolve_policy_name(&resolution), "route-policy");
    }

    #[test]
    fn test_mode_override_ignored_when_disabled() {
        let map = PathPolicyMap::new("default");
        let resolution = DetectionPolicyResolution {
            test_mode_enabled: false,
            test_mode_override: Some("forced"),
            route_attribute_policy: None,
            sandbox_policy: None,
            api_key_overlay: None,
            path: "/",
            path_policy_map: &map,
        };
        assert_eq!(resolve_policy_name(&resolution), "default");
    }

    #[test]
    fn static_asset_extension_check() {
        let mut exts = HashSet::new();
        exts.insert(".js".to_string());
        exts.insert(".css".to_string());
        assert!(is_static_asset_path("/assets/app.js", &exts));
        assert!(!is_static_asset_path("/api/users", &exts));
    }

    #[test]
    fn overlay_skipped_when_policy_is_not_overridable_and_overlay_is_full() {
        let mut policy = DetectionPolicy::new("strict");
        policy.action_policy_overridable = false;
        let mut overlay = ApiKeyOverlay::default();
        overlay.excluded_detectors.insert("ua".to_string());
        apply_overlay(&mut policy, &overlay, false);
        assert!(policy.excluded_detectors.is_empty());
    }
}
