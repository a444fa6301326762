//! Training-Export PII Filter (§4.8): a pure function that strips raw
//! identity data from a signal map before it leaves the process as a
//! training record, plus the path generaliser and label derivation it
//! shares with the rest of the export pipeline.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Field-name groups the filter treats differently (§4.8).
struct FieldGroups {
    always_strip: &'static [&'static str],
    ua_parsed: &'static [&'static str],
    country: &'static [&'static str],
}

const FIELD_GROUPS: FieldGroups = FieldGroups {
    always_strip: &["user_agent", "raw_ua", "ip", "raw_ip", "ip.provider", "ip.asn", "ip.asn_org"],
    ua_parsed: &["ua.family", "ua.version", "ua.os", "ua.browser", "ua.bot_type", "ua.bot_name"],
    country: &["country_code", "ip.country"],
};

fn long_numeric_or_base64_like_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\d{6,}|[A-Za-z0-9+/]{20,}={0,2})$").unwrap())
}

fn absolute_path_with_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/[^\s]*\?").unwrap())
}

/// Strip always-forbidden fields, UA-parsed fields (kept only when the
/// caller is a bot), and country code (kept only for bots) from a signal
/// map. Returns `None` if the map is empty after filtering (§4.8 "Return
/// null if, after filtering, the map is empty").
pub fn filter_signals_for_export(signals: &HashMap<String, Value>, is_bot_detected: bool) -> Option<HashMap<String, Value>> {
    let mut filtered = HashMap::new();

    for (key, value) in signals {
        if FIELD_GROUPS.always_strip.contains(&key.as_str()) {
            continue;
        }
        if FIELD_GROUPS.ua_parsed.contains(&key.as_str()) && !is_bot_detected {
            continue;
        }
        if FIELD_GROUPS.country.contains(&key.as_str()) && !is_bot_detected {
            continue;
        }
        if let Value::String(s) = value {
            if absolute_path_with_query_re().is_match(s) || long_numeric_or_base64_like_re().is_match(s) {
                continue;
            }
        }
        filtered.insert(key.clone(), value.clone());
    }

    if filtered.is_empty() {
        None
    } else {
        Some(filtered)
    }
}

/// Strip query strings, replace GUID-like/long-numeric/base64-like path
/// segments with `*`, keep everything else verbatim (§4.8 "Path
/// generaliser").
pub fn generalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let without_query = path.split('?').next().unwrap_or("");
    if without_query.is_empty() {
        return "/".to_string();
    }

    let guid_like = guid_like_re();
    let digits_re = digits_re();
    let base64_like = base64_like_re();

    let generalized: Vec<&str> = without_query
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment
            } else if guid_like.is_match(segment) || digits_re.is_match(segment) || base64_like.is_match(segment) {
                "*"
            } else {
                segment
            }
        })
        .collect();

    generalized.join("/")
}

fn guid_like_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F-]{8,}$").unwrap())
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4,}$").unwrap())
}

fn base64_like_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/_-]{20,}={0,2}$").unwrap())
}

/// probability >= 0.7 -> "bot"; <= 0.3 -> "human"; else "uncertain"
/// (§4.8 "Label derivation").
pub fn derive_label(probability: f64) -> &'static str {
    if probability >= 0.7 {
        "bot"
    } else if probability <= 0.3 {
        "human"
    } else {
        "uncertain"
    }
}

/// One filtered training-export record (§3 wire format).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrainingExportRecord {
    pub label: String,
    pub probability: f64,
    pub signature: String,
    pub path: String,
    #[serde(rename = "countryCode", skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

/// Build a training-export record from raw request-scoped fields,
/// applying the path generaliser, label derivation, and signal filter.
/// Country code is included only when the caller was detected as a bot,
/// matching the signal-map rule.
pub fn build_export_record(
    probability: f64,
    signature: &str,
    raw_path: &str,
    country_code: Option<&str>,
    signals: &HashMap<String, Value>,
    now: DateTime<Utc>,
) -> TrainingExportRecord {
    let is_bot = probability >= 0.7;
    TrainingExportRecord {
        label: derive_label(probability).to_string(),
        probability,
        signature: signature.to_string(),
        path: generalize_path(raw_path),
        country_code: if is_bot { country_code.map(str::to_string) } else { None },
        signals: filter_signals_for_export(signals, is_bot),
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn always_strip_fields_are_removed_regardless_of_bot_status() {
        let mut signals = HashMap::new();
        signals.insert("user_agent".to_string(), json!("Mozilla/5.0"));
        signals.insert("ip".to_string(), json!("203.0.113.10"));
        signals.insert("ua.family".to_string(), json!("Chrome"));
        let filtered = filter_signals_for_export(&signals, true).unwrap();
        assert!(!filtered.contains_key("user_agent"));
        assert!(!filtered.contains_key("ip"));
    }

    #[test]
    fn ua_parsed_fields_are_kept_for_bots_and_stripped_for_humans() {
        let mut signals = HashMap::new();
        signals.insert("ua.bot_type".to_string(), json!("scraper"));

        let bot_filtered = filter_signals_for_export(&signals, true).unwrap();
        assert!(bot_filtered.contains_key("ua.bot_type"));

        let human_filtered = filter_signals_for_export(&signals, false);
        assert!(human_filtered.is_none());
    }

    #[test]
    fn country_code_kept_for_bots_stripped_for_humans() {
        let mut signals = HashMap::new();
        signals.insert("country_code".to_string(), json!("RU"));
        assert!(filter_signals_for_export(&signals, true).unwrap().contains_key("country_code"));
        assert!(filter_signals_for_export(&signals, false).is_none());
    }

    #[test]
    fn empty_map_after_filtering_returns_none() {
        let mut signals = HashMap::new();
        signals.insert("raw_ip".to_string(), json!("203.0.113.10"));
        assert!(filter_signals_for_export(&signals, true).is_none());
    }

    #[test]
    fn long_numeric_and_base64_looking_values_are_stripped() {
        let mut signals = HashMap::new();
        signals.insert("session".to_string(), json!("dGhpc2lzYWxvbmdiYXNlNjRzdHJpbmc="));
        signals.insert("counter".to_string(), json!("123456789"));
        signals.insert("small".to_string(), json!("ok"));
        let filtered = filter_signals_for_export(&signals, true).unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("small"));
    }

    #[test]
    fn path_generaliser_strips_query_and_replaces_numeric_segments() {
        assert_eq!(generalize_path("/users/482910?token=abc"), "/users/*");
    }

    #[test]
    fn path_generaliser_replaces_guid_like_segments() {
        assert_eq!(generalize_path("/orders/3fa85f64-5717-4562-b3fc"), "/orders/*");
    }

    #[test]
    fn path_generaliser_keeps_ordinary_segments_verbatim() {
        assert_eq!(generalize_path("/products/shoes"), "/products/shoes");
    }

    #[test]
    fn empty_path_generalises_to_root() {
        assert_eq!(generalize_path(""), "/");
        assert_eq!(generalize_path("?a=1"), "/");
    }

    #[test]
    fn label_thresholds_match_spec_boundaries() {
        assert_eq!(derive_label(0.7), "bot");
        assert_eq!(derive_label(0.3), "human");
        assert_eq!(derive_label(0.5), "uncertain");
    }

    #[test]
    fn build_export_record_only_includes_country_for_bots() {
        let signals = HashMap::new();
        let record = build_export_record(0.9, "sig1", "/admin/12345", Some("CN"), &signals, now());
        assert_eq!(record.country_code.as_deref(), Some("CN"));
        assert_eq!(record.path, "/admin/*");
        assert_eq!(record.label, "bot");

        let human_record = build_export_record(0.1, "sig2", "/", Some("US"), &signals, now());
        assert_eq!(human_record.country_code, None);
    }
}
