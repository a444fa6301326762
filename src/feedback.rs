//! Response Feedback (§4.7): a post-handler callback that reads the
//! completed response, nudges the stored evidence toward or away from
//! "bot", and hands a `ResponseSignal` back to behavioural state for the
//! next request.

use crate::aggregator::{AggregatedEvidence, RiskBand};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-status probability deltas (§4.7 table). All values should be in
/// `[-1, 1]`; `authenticated_clear_delta` is conventionally negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFeedbackConfig {
    pub not_found_delta: f64,
    pub unauthorized_delta: f64,
    pub forbidden_delta: f64,
    pub server_error_delta: f64,
    pub gone_delta: f64,
    pub method_not_allowed_delta: f64,
    pub authenticated_clear_delta: f64,
    pub clear_threshold: f64,
    pub clear_max_probability: f64,
}

impl Default for ResponseFeedbackConfig {
    fn default() -> Self {
        Self {
            not_found_delta: 0.05,
            unauthorized_delta: 0.10,
            forbidden_delta: 0.10,
            server_error_delta: 0.02,
            gone_delta: 0.05,
            method_not_allowed_delta: 0.05,
            authenticated_clear_delta: -0.15,
            clear_threshold: 0.3,
            clear_max_probability: 0.7,
        }
    }
}

/// Post-response record consumed by the response coordinator and fed into
/// behavioural waveform state (§3 "ResponseSignal").
#[derive(Debug, Clone)]
pub struct ResponseSignal {
    pub request_id: Uuid,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub bytes: u64,
    pub path: String,
    pub method: String,
    pub processing_time_ms: u64,
    pub probability_at_send: f64,
    pub body_present: bool,
    pub body_len: Option<u64>,
    pub content_type: Option<String>,
}

/// Which per-status rule fired, for logging/observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackRule {
    NotFound,
    Unauthorized,
    Forbidden,
    ServerError,
    Gone,
    MethodNotAllowed,
    AuthenticatedClear,
    None,
}

fn status_delta(config: &ResponseFeedbackConfig, status_code: u16, authenticated: bool, current_probability: f64) -> (f64, FeedbackRule) {
    match status_code {
        404 => (config.not_found_delta, FeedbackRule::NotFound),
        401 if !authenticated => (config.unauthorized_delta, FeedbackRule::Unauthorized),
        403 if !authenticated => (config.forbidden_delta, FeedbackRule::Forbidden),
        410 => (config.gone_delta, FeedbackRule::Gone),
        405 => (config.method_not_allowed_delta, FeedbackRule::MethodNotAllowed),
        500..=599 => (config.server_error_delta, FeedbackRule::ServerError),
        200..=299 if authenticated && current_probability > config.clear_threshold && current_probability <= config.clear_max_probability => {
            (config.authenticated_clear_delta, FeedbackRule::AuthenticatedClear)
        }
        _ => (0.0, FeedbackRule::None),
    }
}

/// Reason phrase for the synthetic "ResponseStatusBoost" ledger contribution
/// (§3 "DetectionLedger", scenario: `"Response 404 Not Found on <path>"`).
fn status_reason(rule: FeedbackRule, status_code: u16, path: &str) -> String {
    let text = match rule {
        FeedbackRule::NotFound => "Not Found",
        FeedbackRule::Unauthorized => "Unauthorized",
        FeedbackRule::Forbidden => "Forbidden",
        FeedbackRule::Gone => "Gone",
        FeedbackRule::MethodNotAllowed => "Method Not Allowed",
        FeedbackRule::ServerError => "Server Error",
        FeedbackRule::AuthenticatedClear => "Authenticated Clear",
        FeedbackRule::None => "",
    };
    format!("Response {status_code} {text} on {path}")
}

/// Apply response feedback to one request's evidence (§4.7). Returns the
/// rewritten evidence (clamped, re-banded, with the synthetic ledger
/// contribution's delta folded in) plus the `ResponseSignal` to hand to
/// the response coordinator. `evidence` is consumed and returned rather
/// than mutated in place, matching the "rewrite the evidence" wording —
/// callers own where the rewritten copy is stored (request scratch).
#[allow(clippy::too_many_arguments)]
pub fn apply_response_feedback(
    config: &ResponseFeedbackConfig,
    mut evidence: AggregatedEvidence,
    request_id: Uuid,
    signature: &str,
    status_code: u16,
    authenticated: bool,
    bytes: u64,
    path: &str,
    method: &str,
    processing_time_ms: u64,
    body_len: Option<u64>,
    content_type: Option<String>,
    now: DateTime<Utc>,
) -> (AggregatedEvidence, ResponseSignal) {
    let (delta, rule) = status_delta(config, status_code, authenticated, evidence.bot_probability);

    if rule != FeedbackRule::None {
        let probability_at_send = evidence.bot_probability;
        let new_probability = (evidence.bot_probability + delta).clamp(0.0, 1.0);
        evidence.bot_probability = new_probability;
        evidence.risk_band = RiskBand::from_probability(new_probability);
        evidence.contributing_detectors.push("ResponseStatusBoost".to_string());
        evidence.ledger.push_response_status_boost(delta, status_reason(rule, status_code, path));

        let signal = ResponseSignal {
            request_id,
            signature: signature.to_string(),
            timestamp: now,
            status_code,
            bytes,
            path: path.to_string(),
            method: method.to_string(),
            processing_time_ms,
            probability_at_send,
            body_present: body_len.is_some(),
            body_len,
            content_type,
        };
        (evidence, signal)
    } else {
        let signal = ResponseSignal {
            request_id,
            signature: signature.to_string(),
            timestamp: now,
            status_code,
            bytes,
            path: path.to_string(),
            method: method.to_string(),
            processing_time_ms,
            probability_at_send: evidence.bot_probability,
            body_present: body_len.is_some(),
            body_len,
            content_type,
        };
        (evidence, signal)
    }
}
