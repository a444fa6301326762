//! `EngineConfig` (§6): the full configuration surface, validated once at
//! startup (§7 "configuration error... detected at startup; fatal").
//! Grounded on `OrchestratorConfig`/`OrchestratorConfigBuilder`'s
//! serde-derived-struct-plus-fluent-builder shape.

use crate::error::{Error, Result};
use crate::feedback::ResponseFeedbackConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::policy::detection::PathPolicyMap;
use crate::policy::{ActionPolicyRegistry, DetectionPolicy};
use crate::upstream_trust::UpstreamTrustConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Throttle-action defaults shared by every `ActionKind::Throttle` unless
/// overridden per action-policy (§6 `throttling.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    pub base_delay_ms: u64,
    pub jitter_pct: f64,
    pub scale_by_risk: bool,
    pub response_delay_ms: u64,
    pub challenge_kind: String,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            jitter_pct: 20.0,
            scale_by_risk: true,
            response_delay_ms: 0,
            challenge_kind: "captcha".to_string(),
        }
    }
}

/// Which response headers to emit and under what prefix (§6
/// `responseHeaders.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeadersConfig {
    pub enabled: bool,
    pub prefix: String,
    pub include_full_result_base64: bool,
    pub include_trust_marker: bool,
}

impl Default for ResponseHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "X-Bot-".to_string(),
            include_full_result_base64: false,
            include_trust_marker: false,
        }
    }
}

/// Bot-type allow-through toggles (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowListConfig {
    pub allow_verified_search_engines: bool,
    pub allow_social_media_bots: bool,
    pub allow_monitoring_bots: bool,
    pub allow_tools: bool,
}

/// Wave composition and sampling for the fast path (§6 `fastPath.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathConfig {
    pub max_parallel_detectors: usize,
    pub quorum_confidence_threshold: f64,
    pub drift_sample_rate: f64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            max_parallel_detectors: 8,
            quorum_confidence_threshold: 0.9,
            drift_sample_rate: 0.01,
        }
    }
}

/// The engine's full configuration surface (§6 "hierarchical options
/// object, deserialised from any configuration source").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enabled: bool,
    pub bot_threshold: f64,
    pub enable_test_mode: bool,
    /// Base64-encoded MAC key. Required when `require_signature_key` is
    /// set (production mode); falls back to a dev-random key otherwise.
    pub signature_hash_key: Option<String>,
    pub require_signature_key: bool,
    pub upstream_trust: UpstreamTrustConfig,
    pub excluded_paths: HashSet<String>,
    pub signature_only_paths: HashSet<String>,
    pub path_policies: PathPolicyMap,
    pub policies: HashMap<String, DetectionPolicy>,
    pub default_policy_name: String,
    pub action_policies: ActionPolicyRegistry,
    pub default_action_policy_name: Option<String>,
    pub bot_type_action_policies: HashMap<String, String>,
    pub response_status_boost: ResponseFeedbackConfig,
    pub response_headers: ResponseHeadersConfig,
    pub throttling: ThrottlingConfig,
    pub allow_list: AllowListConfig,
    pub fast_path: FastPathConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_threshold: 0.7,
            enable_test_mode: false,
            signature_hash_key: None,
            require_signature_key: false,
            upstream_trust: UpstreamTrustConfig::default(),
            excluded_paths: HashSet::new(),
            signature_only_paths: HashSet::new(),
            path_policies: PathPolicyMap::new("default".to_string()),
            policies: HashMap::from([("default".to_string(), DetectionPolicy::new("default"))]),
            default_policy_name: "default".to_string(),
            action_policies: ActionPolicyRegistry::new(),
            default_action_policy_name: None,
            bot_type_action_policies: HashMap::new(),
            response_status_boost: ResponseFeedbackConfig::default(),
            response_headers: ResponseHeadersConfig::default(),
            throttling: ThrottlingConfig::default(),
            allow_list: AllowListConfig::default(),
            fast_path: FastPathConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the full configuration surface. Fatal at startup only
    /// (§7); runtime errors inside detectors must never reach here.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.bot_threshold) {
            return Err(Error::config(format!("botThreshold must be in [0,1], got {}", self.bot_threshold)));
        }

        if self.require_signature_key && self.signature_hash_key.is_none() {
            return Err(Error::config("signatureHashKey is required when require_signature_key is set"));
        }

        if let Some(key) = &self.signature_hash_key {
            crate::signature::MacKey::from_base64(key)?;
        }

        if !self.policies.contains_key(&self.default_policy_name) {
            return Err(Error::config(format!("defaultPolicyName '{}' has no matching entry in policies", self.default_policy_name)));
        }

        if let Some(name) = &self.default_action_policy_name {
            if self.action_policies.get(name).is_none() {
                return Err(Error::config(format!("defaultActionPolicyName '{name}' has no matching entry in actionPolicies")));
            }
        }

        for name in self.bot_type_action_policies.values() {
            if self.action_policies.get(name).is_none() {
                return Err(Error::config(format!("botTypeActionPolicies references unknown action policy '{name}'")));
            }
        }

        if self.upstream_trust.enabled && self.upstream_trust.max_age_seconds <= 0 {
            return Err(Error::config("upstreamSignatureMaxAgeSeconds must be positive"));
        }

        if !(0.0..=1.0).contains(&self.fast_path.quorum_confidence_threshold) {
            return Err(Error::config("fastPath.quorumConfidenceThreshold must be in [0,1]"));
        }

        Ok(())
    }

    /// The effective MAC key: configured key, or a dev-random fallback
    /// when production mode isn't required (§6; `validate()` already
    /// rejects the unconfigured-in-prod case).
    pub fn mac_key(&self) -> Result<crate::signature::MacKey> {
        match &self.signature_hash_key {
            Some(key) => crate::signature::MacKey::from_base64(key),
            None => Ok(crate::signature::MacKey::dev_random()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn bot_threshold_out_of_range_is_rejected() {
        let mut config = EngineConfig::default();
        config.bot_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_signature_key_in_prod_mode_is_rejected() {
        let mut config = EngineConfig::default();
        config.require_signature_key = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_signature_key_is_rejected() {
        let mut config = EngineConfig::default();
        config.signature_hash_key = Some("not valid base64!!".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_policy_name_must_exist_in_policies_map() {
        let mut config = EngineConfig::default();
        config.default_policy_name = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn dangling_bot_type_action_policy_reference_is_rejected() {
        let mut config = EngineConfig::default();
        config.bot_type_action_policies.insert("scraper".to_string(), "nonexistent".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn mac_key_falls_back_to_dev_random_when_unconfigured() {
        let config = EngineConfig::default();
        assert!(config.mac_key().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = EngineConfig::default();
        config.path_policies = PathPolicyMap::new("default")
            .with_exact("/login", "strict")
            .with_path_policy("/api/**", "api-policy");
        config.action_policies.insert(crate::policy::ActionPolicy::new(
            "slow-down",
            crate::policy::ActionKind::Throttle {
                base_delay_ms: 500,
                jitter_pct: 10.0,
                scale_by_risk: true,
                response_delay_ms: 0,
            },
        ));

        let json = serde_json::to_string(&config).expect("config must serialise");
        let restored: EngineConfig = serde_json::from_str(&json).expect("config must deserialise");

        assert!(restored.validate().is_ok());
        assert_eq!(restored.path_policies.resolve("/login"), "strict");
        assert_eq!(restored.path_policies.resolve("/api/widgets/1"), "api-policy");
        assert!(restored.action_policies.get("slow-down").is_some());
    }
}
