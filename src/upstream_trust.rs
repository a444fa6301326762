//! Upstream-Trust Hydration (§4.6): accept a trusted proxy's pre-computed
//! detection in lieu of running locally, gated on HMAC-SHA256 verification.
//! Any verification failure fails closed — the caller falls through to
//! local detection, it never blocks the request.

use crate::aggregator::{AggregatedEvidence, CategoryScore, RiskBand};
use crate::envelope::{Headers, RequestEnvelope};
use crate::error::{Error, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Header names the engine reads from a trusted proxy (§4.6).
pub mod headers {
    pub const DETECTED: &str = "X-Bot-Detected";
    pub const PROBABILITY: &str = "X-Bot-Detection-Probability";
    pub const CONFIDENCE: &str = "X-Bot-Confidence";
    pub const BOT_TYPE: &str = "X-Bot-Type";
    pub const BOT_NAME: &str = "X-Bot-Name";
    pub const BOT_CATEGORY: &str = "X-Bot-Category";
    pub const RISK_BAND: &str = "X-Bot-Detection-RiskBand";
    pub const PROCESSING_MS: &str = "X-Bot-Detection-ProcessingMs";
    pub const ACTION: &str = "X-Bot-Detection-Action";
    pub const CONTRIBUTIONS: &str = "X-Bot-Detection-Contributions";
    pub const REASONS: &str = "X-Bot-Detection-Reasons";
    pub const SIGNALS: &str = "X-Bot-Detection-Signals";
    pub const TIMESTAMP: &str = "X-Bot-Detection-Timestamp";
    pub const SIGNATURE: &str = "X-Bot-Detection-Signature";
}

/// Bound on the `X-Bot-Detection-Signals` JSON payload (§4.6, §3 wire
/// format: "byte size ≤ 16 KiB").
const SIGNALS_MAX_BYTES: usize = 16 * 1024;

/// How the engine should trust an upstream proxy's headers (§6
/// `upstreamSignatureHeader`/`upstreamSignatureSecret`/
/// `upstreamSignatureMaxAgeSeconds`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpstreamTrustConfig {
    pub enabled: bool,
    /// Base64-decoded HMAC secret. If `None`, verification is skipped —
    /// the upstream headers are trusted unconditionally when `enabled`.
    pub secret: Option<Vec<u8>>,
    pub max_age_seconds: i64,
}

impl Default for UpstreamTrustConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            max_age_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RawContribution {
    name: String,
    category: String,
    #[serde(rename = "confidenceDelta")]
    confidence_delta: f64,
    weight: f64,
}

/// Attempt to hydrate `AggregatedEvidence` from a trusted proxy's headers.
/// Returns `Ok(None)` if upstream-trust is disabled or the request carries
/// no `X-Bot-Detected` header (ordinary local-detection path). Returns
/// `Err` only on verification failure — callers must treat that as "fall
/// through to local detection", never as a request-ending error.
pub fn try_hydrate(config: &UpstreamTrustConfig, envelope: &RequestEnvelope) -> Result<Option<AggregatedEvidence>> {
    if !config.enabled {
        return Ok(None);
    }
    let Some(detected_raw) = envelope.headers.get(headers::DETECTED) else {
        return Ok(None);
    };

    if let Some(secret) = &config.secret {
        verify_signature(secret, config.max_age_seconds, &envelope.headers)?;
    }

    let detected = detected_raw.eq_ignore_ascii_case("true") || detected_raw == "1";

    let probability: f64 = envelope
        .headers
        .get(headers::PROBABILITY)
        .or_else(|| envelope.headers.get(headers::CONFIDENCE))
        .and_then(|v| v.parse().ok())
        .unwrap_or(if detected { 1.0 } else { 0.0 });

    let confidence: f64 = envelope.headers.get(headers::CONFIDENCE).and_then(|v| v.parse().ok()).unwrap_or(0.5);

    let risk_band = envelope
        .headers
        .get(headers::RISK_BAND)
        .and_then(parse_risk_band)
        .unwrap_or_else(|| RiskBand::from_probability(probability));

    let processing_time_ms: u64 = envelope.headers.get(headers::PROCESSING_MS).and_then(|v| v.parse().ok()).unwrap_or(0);

    let contributions: Vec<RawContribution> = envelope
        .headers
        .get(headers::CONTRIBUTIONS)
        .map(|raw| serde_json::from_str(raw).unwrap_or_default())
        .unwrap_or_default();

    let mut category_breakdown: HashMap<String, CategoryScore> = HashMap::new();
    let mut contributing_detectors = Vec::with_capacity(contributions.len());
    for c in &contributions {
        contributing_detectors.push(c.name.clone());
        let entry = category_breakdown.entry(c.category.clone()).or_insert_with(|| CategoryScore {
            score: 0.0,
            contributors: Vec::new(),
        });
        entry.score += c.confidence_delta * c.weight;
        entry.contributors.push(c.name.clone());
    }

    if let Some(signals_raw) = envelope.headers.get(headers::SIGNALS) {
        if signals_raw.len() > SIGNALS_MAX_BYTES {
            return Err(Error::upstream_trust_rejected("signals header exceeds 16 KiB"));
        }
    }

    Ok(Some(AggregatedEvidence {
        bot_probability: probability,
        confidence,
        risk_band,
        primary_bot_type: envelope.headers.get(headers::BOT_TYPE).map(str::to_string),
        primary_bot_name: envelope.headers.get(headers::BOT_NAME).map(str::to_string),
        category_breakdown,
        contributing_detectors,
        early_exit: false,
        early_exit_verdict: None,
        total_processing_time_ms: processing_time_ms,
        ai_ran: false,
        policy_name: "upstream".to_string(),
        triggered_action_policy_name: envelope.headers.get(headers::ACTION).map(str::to_string),
        ledger: crate::ledger::DetectionLedger::new(envelope.request_id),
        signals: HashMap::new(),
        policy_action: None,
    }))
}

fn parse_risk_band(raw: &str) -> Option<RiskBand> {
    match raw {
        "VeryLow" => Some(RiskBand::VeryLow),
        "Low" => Some(RiskBand::Low),
        "Elevated" => Some(RiskBand::Elevated),
        "Medium" => Some(RiskBand::Medium),
        "High" => Some(RiskBand::High),
        "VeryHigh" => Some(RiskBand::VeryHigh),
        _ => None,
    }
}

/// HMAC-SHA256 over `detected:probability:timestamp`, base64, constant-time
/// compare (§4.6). Fails closed on anything malformed or stale.
fn verify_signature(secret: &[u8], max_age_seconds: i64, headers: &Headers) -> Result<()> {
    let signature_b64 = headers.get(headers::SIGNATURE).ok_or_else(|| Error::upstream_trust_rejected("missing signature header"))?;
    let detected = headers.get(headers::DETECTED).unwrap_or("");
    let probability = headers.get(headers::PROBABILITY).unwrap_or("");
    let timestamp_raw = headers.get(headers::TIMESTAMP).ok_or_else(|| Error::upstream_trust_rejected("missing timestamp header"))?;

    let timestamp: i64 = timestamp_raw.parse().map_err(|_| Error::upstream_trust_rejected("malformed timestamp"))?;
    let age = Utc::now().timestamp() - timestamp;
    if age > max_age_seconds || age < 0 {
        return Err(Error::upstream_trust_rejected("stale or future timestamp"));
    }

    use base64::Engine;
    let provided_mac = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| Error::upstream_trust_rejected("malformed signature encoding"))?;

    let message = format!("{detected}:{probability}:{timestamp}");
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Error::upstream_trust_rejected("invalid secret"))?;
    mac.update(message.as_bytes());

    // `verify_slice` is constant-time (§4.6 "constant-time compare").
    mac.verify_slice(&provided_mac).map_err(|_| Error::upstream_trust_rejected("signature mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_envelope(secret: &[u8], detected: &str, probability: &str, timestamp: i64) -> RequestEnvelope {
        let message = format!("{detected}:{probability}:{timestamp}");
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(message.as_bytes());
        let sig = mac.finalize().into_bytes();
        use base64::Engine;
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig);

        RequestEnvelope::new("GET", "/", "203.0.113.1")
            .with_header(headers::DETECTED, detected)
            .with_header(headers::PROBABILITY, probability)
            .with_header(headers::TIMESTAMP, timestamp.to_string())
            .with_header(headers::SIGNATURE, sig_b64)
    }

    #[test]
    fn disabled_config_never_hydrates() {
        let config = UpstreamTrustConfig::default();
        let envelope = RequestEnvelope::new("GET", "/", "203.0.113.1").with_header(headers::DETECTED, "true");
        assert!(try_hydrate(&config, &envelope).unwrap().is_none());
    }

    #[test]
    fn no_detected_header_means_no_hydration_even_when_enabled() {
        let config = UpstreamTrustConfig {
            enabled: true,
            secret: None,
            max_age_seconds: 30,
        };
        let envelope = RequestEnvelope::new("GET", "/", "203.0.113.1");
        assert!(try_hydrate(&config, &envelope).unwrap().is_none());
    }

    #[test]
    fn valid_signature_hydrates_evidence() {
        let secret = b"shared-upstream-secret".to_vec();
        let now = Utc::now().timestamp();
        let envelope = signed_envelope(&secret, "true", "0.95", now);
        let config = UpstreamTrustConfig {
            enabled: true,
            secret: Some(secret),
            max_age_seconds: 30,
        };
        let evidence = try_hydrate(&config, &envelope).unwrap().unwrap();
        assert_eq!(evidence.bot_probability, 0.95);
        assert_eq!(evidence.policy_name, "upstream");
    }

    #[test]
    fn tampered_probability_fails_closed() {
        let secret = b"shared-upstream-secret".to_vec();
        let now = Utc::now().timestamp();
        let mut envelope = signed_envelope(&secret, "true", "0.95", now);
        envelope = envelope.with_header(headers::PROBABILITY, "0.01");
        let config = UpstreamTrustConfig {
            enabled: true,
            secret: Some(secret),
            max_age_seconds: 30,
        };
        assert!(try_hydrate(&config, &envelope).is_err());
    }

    #[test]
    fn stale_timestamp_fails_closed() {
        let secret = b"shared-upstream-secret".to_vec();
        let stale = Utc::now().timestamp() - 3600;
        let envelope = signed_envelope(&secret, "true", "0.95", stale);
        let config = UpstreamTrustConfig {
            enabled: true,
            secret: Some(secret),
            max_age_seconds: 30,
        };
        assert!(try_hydrate(&config, &envelope).is_err());
    }

    #[test]
    fn missing_signature_fails_closed_when_secret_configured() {
        let config = UpstreamTrustConfig {
            enabled: true,
            secret: Some(b"shared-upstream-secret".to_vec()),
            max_age_seconds: 30,
        };
        let envelope = RequestEnvelope::new("GET", "/", "203.0.113.1").with_header(headers::DETECTED, "true");
        assert!(try_hydrate(&config, &envelope).is_err());
    }

    #[test]
    fn oversized_signals_header_is_rejected() {
        let config = UpstreamTrustConfig {
            enabled: true,
            secret: None,
            max_age_seconds: 30,
        };
        let oversized = "x".repeat(SIGNALS_MAX_BYTES + 1);
        let envelope = RequestEnvelope::new("GET", "/", "203.0.113.1")
            .with_header(headers::DETECTED, "true")
            .with_header(headers::SIGNALS, oversized);
        assert!(try_hydrate(&config, &envelope).is_err());
    }
}
