//! Action-policy resolution and execution (§4.4, §6, §7): what to do about
//! an aggregated verdict.

use crate::aggregator::AggregatedEvidence;
use crate::orchestrator::EarlyExitVerdict;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// A named strategy for responding to an aggregated verdict (§3
/// "ActionPolicy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionKind {
    Block {
        status_code: u16,
        message: String,
    },
    Throttle {
        base_delay_ms: u64,
        jitter_pct: f64,
        scale_by_risk: bool,
        response_delay_ms: u64,
    },
    Challenge {
        challenge_kind: String,
    },
    Redirect {
        url: String,
    },
    LogOnly,
    Debug,
}

impl ActionKind {
    /// Stable string label used to populate `AggregatedEvidence::policy_action`
    /// (§3 Data Model) once an action is resolved.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Block { .. } => "Block",
            Self::Throttle { .. } => "Throttle",
            Self::Challenge { .. } => "Challenge",
            Self::Redirect { .. } => "Redirect",
            Self::LogOnly => "LogOnly",
            Self::Debug => "Debug",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPolicy {
    pub name: String,
    pub kind: ActionKind,
}

impl ActionPolicy {
    pub fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Result of executing an action policy (§3: "An action-policy execution
/// returns `{Continue: bool}`").
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub continue_request: bool,
    pub status_code: Option<u16>,
    pub body: Option<Value>,
    pub response_headers: Vec<(String, String)>,
    /// Stable label of the resolved `ActionKind`, or `"Allow"` when no
    /// action policy fired (§3 Data Model `policyAction`).
    pub action_kind: String,
}

impl ActionOutcome {
    fn allow() -> Self {
        Self {
            continue_request: true,
            status_code: None,
            body: None,
            response_headers: Vec::new(),
            action_kind: "Allow".to_string(),
        }
    }
}

/// Name -> `ActionPolicy` lookup table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPolicyRegistry {
    policies: HashMap<String, ActionPolicy>,
}

impl ActionPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, policy: ActionPolicy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn get(&self, name: &str) -> Option<&ActionPolicy> {
        self.policies.get(name)
    }
}

fn execute(action: &ActionPolicy, evidence: &AggregatedEvidence, detection_policy_name: &str) -> ActionOutcome {
    let action_kind = action.kind.label().to_string();
    match &action.kind {
        ActionKind::Block { status_code, message } => ActionOutcome {
            continue_request: false,
            status_code: Some(*status_code),
            body: Some(json!({
                "error": message,
                "riskScore": evidence.bot_probability,
                "policy": detection_policy_name,
            })),
            response_headers: Vec::new(),
            action_kind,
        },
        ActionKind::Throttle {
            base_delay_ms,
            jitter_pct,
            scale_by_risk,
            response_delay_ms,
        } => {
            let scaled = if *scale_by_risk {
                (*base_delay_ms as f64 * (1.0 + evidence.bot_probability)) as u64
            } else {
                *base_delay_ms
            };
            let jittered = scaled + ((scaled as f64) * jitter_pct / 100.0) as u64;
            let retry_after_secs = (jittered.max(*response_delay_ms) / 1000).max(1);
            ActionOutcome {
                continue_request: false,
                status_code: Some(429),
                body: Some(json!({
                    "error": "Too many requests",
                    "retryAfter": retry_after_secs,
                    "message": "Request throttled",
                })),
                response_headers: vec![("Retry-After".to_string(), retry_after_secs.to_string())],
                action_kind,
            }
        }
        ActionKind::Challenge { challenge_kind } => ActionOutcome {
            continue_request: false,
            status_code: Some(403),
            body: Some(json!({
                "error": "Challenge required",
                "challengeType": challenge_kind,
                "riskScore": evidence.bot_probability,
            })),
            response_headers: vec![("X-Bot-Challenge".to_string(), "required".to_string())],
            action_kind,
        },
        ActionKind::Redirect { url } => ActionOutcome {
            continue_request: false,
            status_code: Some(302),
            body: None,
            response_headers: vec![("Location".to_string(), url.clone())],
            action_kind,
        },
        ActionKind::LogOnly | ActionKind::Debug => ActionOutcome { action_kind, ..ActionOutcome::allow() },
    }
}

/// Resolve and execute the action policy for one request's aggregated
/// evidence, in the precedence declared by §4.4:
/// 1. `evidence.triggeredActionPolicyName`, if present.
/// 2. Else, if `probability >= botThreshold` and the verdict isn't
///    verified-good/whitelisted, the bot-type -> action-policy map keyed
///    on `primaryBotType`.
/// 3. Else `defaultActionPolicyName`.
/// 4. Else a built-in block/throttle decision from `immediateBlockThreshold`.
///
/// The confidence gate (Open Question decision: block-only) and the
/// whitelist rule (verified-good-bot/whitelisted never block here) are
/// applied regardless of which branch resolved the name.
#[allow(clippy::too_many_arguments)]
pub fn resolve_action(
    evidence: &AggregatedEvidence,
    detection_policy_name: &str,
    immediate_block_threshold: f64,
    min_confidence: f64,
    registry: &ActionPolicyRegistry,
    bot_type_action_policies: &HashMap<String, String>,
    bot_threshold: f64,
    default_action_policy_name: Option<&str>,
) -> ActionOutcome {
    let whitelisted = matches!(
        evidence.early_exit_verdict,
        Some(EarlyExitVerdict::VerifiedGoodBot) | Some(EarlyExitVerdict::Whitelisted)
    );
    if whitelisted {
        return ActionOutcome::allow();
    }

    let resolved_name: Option<String> = evidence
        .triggered_action_policy_name
        .clone()
        .or_else(|| {
            if evidence.bot_probability >= bot_threshold {
                evidence
                    .primary_bot_type
                    .as_ref()
                    .and_then(|bot_type| bot_type_action_policies.get(bot_type))
                    .cloned()
            } else {
                None
            }
        })
        .or_else(|| default_action_policy_name.map(str::to_string));

    let built_in_block = ActionPolicy::new(
        "built-in-block",
        ActionKind::Block {
            status_code: 403,
            message: "Access denied".to_string(),
        },
    );

    let resolved_policy: Option<&ActionPolicy> = match &resolved_name {
        Some(name) => registry.get(name),
        None if evidence.bot_probability >= immediate_block_threshold => Some(&built_in_block),
        None => None,
    };

    let Some(policy) = resolved_policy else {
        return ActionOutcome::allow();
    };

    // Confidence gate applies to Block only (§4.4; Open Question decision
    // in DESIGN.md). Throttle/Challenge/Redirect proceed ungated.
    if matches!(policy.kind, ActionKind::Block { .. }) && evidence.confidence < min_confidence {
        return ActionOutcome::allow();
    }

    execute(policy, evidence, detection_policy_name)
}
