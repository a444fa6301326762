//! The `Engine`: the top-level in-process pipeline wiring the orchestrator,
//! aggregator, policy engine, signature/visitor caches, and feedback path
//! together for one request (§2 "Control flow for one request").
//!
//! Detectors are injected at construction as a named registry, grounded on
//! the teacher's composition-root style of wiring concrete implementations
//! behind a trait object rather than discovering them by reflection (§9).

use crate::aggregator::{self, AggregatedEvidence};
use crate::config::EngineConfig;
use crate::detector::{Detector, Wave};
use crate::envelope::{scratch_keys, RequestEnvelope};
use crate::error::{Error, Result};
use crate::feedback::{self, ResponseSignal};
use crate::orchestrator::{DetectionOutcome, Orchestrator, WaveSpec};
use crate::policy::detection::{ApiKeyOverlay, DetectionPolicyResolution};
use crate::policy::{self, ActionOutcome, DetectionPolicy};
use crate::signature::cache::{DetectionEvent, SignatureAggregateCache};
use crate::signature::visitor::{VisitorEvent, VisitorListCache};
use crate::signature::{derive_signatures, ClientSideFingerprint, MacKey, PluginFingerprint};
use crate::sink::SignalSink;
use chrono::Utc;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Optional per-request inputs that only exist for some requests: an
/// API-key overlay, a sandbox override, a route-attribute policy name, and
/// a client-side/plugin fingerprint postback.
#[derive(Default)]
pub struct RequestContext {
    pub api_key_overlay: Option<ApiKeyOverlay>,
    pub sandbox_policy: Option<String>,
    pub route_attribute_policy: Option<String>,
    pub client_side: Option<ClientSideFingerprint>,
    pub plugin: Option<PluginFingerprint>,
    pub country_code: Option<String>,
}

/// Outcome of running the pipeline up to (but not including) the
/// downstream handler: the action to take plus everything the handler and
/// the later response-feedback step need.
pub struct PipelineOutcome {
    pub action: ActionOutcome,
    pub evidence: Option<AggregatedEvidence>,
    pub policy_name: String,
    pub signature: Option<String>,
}

/// Ties the Blackboard Orchestrator, Evidence Aggregator, Policy Engine,
/// signature/visitor caches, and signal sink together for one request.
pub struct Engine {
    config: EngineConfig,
    mac_key: MacKey,
    orchestrator: Orchestrator,
    registry: Vec<(String, Wave, Arc<dyn Detector>)>,
    signature_cache: Arc<SignatureAggregateCache>,
    visitor_cache: Arc<VisitorListCache>,
    signal_sink: Arc<SignalSink>,
}

impl Engine {
    /// Build an engine from a validated config and a detector registry.
    /// `validate()` is re-run here so a caller can never construct an
    /// engine from an invalid config (§7 "fatal at startup").
    pub fn new(config: EngineConfig, detectors: Vec<(String, Wave, Arc<dyn Detector>)>) -> Result<Self> {
        config.validate()?;
        let mac_key = config.mac_key()?;
        let orchestrator = Orchestrator::new(config.orchestrator.clone());
        Ok(Self {
            config,
            mac_key,
            orchestrator,
            registry: detectors,
            signature_cache: Arc::new(SignatureAggregateCache::new(10_000)),
            visitor_cache: Arc::new(VisitorListCache::new(10_000)),
            signal_sink: Arc::new(SignalSink::default()),
        })
    }

    pub fn signature_cache(&self) -> &Arc<SignatureAggregateCache> {
        &self.signature_cache
    }

    pub fn visitor_cache(&self) -> &Arc<VisitorListCache> {
        &self.visitor_cache
    }

    pub fn signal_sink(&self) -> &Arc<SignalSink> {
        &self.signal_sink
    }

    /// Steps 1-7 of the pipeline (§2): admit, resolve policy, derive
    /// signatures, detect, aggregate, update caches, decide an action.
    /// Returns the action to execute; the caller runs the downstream
    /// handler and later calls `apply_response_feedback`.
    #[instrument(skip(self, envelope, ctx), fields(request_id = %envelope.request_id))]
    pub async fn process(&self, envelope: &RequestEnvelope, ctx: &RequestContext) -> Result<PipelineOutcome> {
        // Step 1: admit / fast-bypass.
        if !self.config.enabled || self.config.excluded_paths.contains(&envelope.path) {
            return Ok(PipelineOutcome {
                action: allow(),
                evidence: None,
                policy_name: "bypassed".to_string(),
                signature: None,
            });
        }

        // Upstream-trust verification failures fail closed: fall through
        // to local detection rather than abort the pipeline (§4.6 "On any
        // verification failure... fall through to local detection").
        match crate::upstream_trust::try_hydrate(&self.config.upstream_trust, envelope) {
            Ok(Some(mut evidence)) => {
                let action = self.decide_action(&evidence);
                evidence.policy_action = Some(action.action_kind.clone());
                envelope.scratch.set(scratch_keys::AGGREGATED_EVIDENCE, evidence.bot_probability);
                return Ok(PipelineOutcome {
                    action,
                    evidence: Some(evidence),
                    policy_name: "upstream".to_string(),
                    signature: None,
                });
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "upstream-trust hydration rejected, falling through to local detection");
            }
        }

        // Step 2: policy resolution.
        let resolution = DetectionPolicyResolution {
            test_mode_enabled: self.config.enable_test_mode,
            test_mode_override: None,
            route_attribute_policy: ctx.route_attribute_policy.as_deref(),
            sandbox_policy: ctx.sandbox_policy.as_deref(),
            api_key_overlay: ctx.api_key_overlay.as_ref(),
            path: &envelope.path,
            path_policy_map: &self.config.path_policies,
        };
        let policy_name = policy::resolve_policy_name(&resolution);
        let mut detection_policy = self
            .config
            .policies
            .get(&policy_name)
            .cloned()
            .ok_or_else(|| Error::config(format!("resolved detection policy '{policy_name}' is not registered")))?;

        if let Some(overlay) = &ctx.api_key_overlay {
            policy::apply_overlay(&mut detection_policy, overlay, false);
        }

        if self.config.signature_only_paths.contains(&envelope.path) {
            return Ok(PipelineOutcome {
                action: allow(),
                evidence: None,
                policy_name,
                signature: Some(self.derive_signature(envelope, ctx).primary),
            });
        }

        // Step 3: signature computation.
        let signatures = self.derive_signature(envelope, ctx);
        envelope.scratch.set(scratch_keys::SIGNATURES, signatures.primary.clone());

        // Step 4: orchestrated detection.
        let wave_specs = self.build_wave_plan(&detection_policy);
        let outcome: DetectionOutcome = self.orchestrator.detect(envelope, &wave_specs, envelope.cancellation.clone()).await?;

        // Step 5: aggregation.
        let overrides = detection_policy.weight_overrides();
        let mut evidence = aggregator::aggregate(
            &outcome.ledger,
            &outcome.blackboard,
            outcome.early_exit,
            outcome.early_exit_verdict,
            outcome.total_processing_time_ms,
            &overrides,
            aggregator::DEFAULT_CONFIDENCE_CALIBRATION,
            &policy_name,
            &detection_policy.transitions,
        );

        // Step 6: cache & feed.
        self.update_caches(&signatures.primary, &evidence, envelope, ctx);

        envelope.scratch.set(scratch_keys::BOT_PROBABILITY, evidence.bot_probability);
        envelope.scratch.set(scratch_keys::DETECTION_CONFIDENCE, evidence.confidence);
        envelope.scratch.set(scratch_keys::POLICY_NAME, policy_name.clone());

        // Step 7: action decision.
        let action = self.decide_action(&evidence);
        evidence.policy_action = Some(action.action_kind.clone());

        Ok(PipelineOutcome {
            action,
            evidence: Some(evidence),
            policy_name,
            signature: Some(signatures.primary),
        })
    }

    /// Step 9: response feedback, run after the downstream handler
    /// completes (§4.7). Returns the boosted/cleared evidence plus the
    /// `ResponseSignal` to feed back into behavioural state.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_response_feedback(
        &self,
        evidence: AggregatedEvidence,
        request_id: uuid::Uuid,
        signature: &str,
        status_code: u16,
        authenticated: bool,
        bytes: u64,
        path: &str,
        method: &str,
        processing_time_ms: u64,
    ) -> (AggregatedEvidence, ResponseSignal) {
        feedback::apply_response_feedback(
            &self.config.response_status_boost,
            evidence,
            request_id,
            signature,
            status_code,
            authenticated,
            bytes,
            path,
            method,
            processing_time_ms,
            None,
            None,
            Utc::now(),
        )
    }

    fn derive_signature(&self, envelope: &RequestEnvelope, ctx: &RequestContext) -> crate::signature::SignatureSet {
        derive_signatures(
            &self.mac_key,
            &envelope.connection_ip,
            envelope.user_agent(),
            ctx.client_side.as_ref(),
            ctx.plugin.as_ref(),
        )
    }

    fn decide_action(&self, evidence: &AggregatedEvidence) -> ActionOutcome {
        let policy_name = &evidence.policy_name;
        let detection_policy = self.config.policies.get(policy_name);
        let (immediate_block_threshold, min_confidence) = detection_policy
            .map(|p| (p.immediate_block_threshold, p.min_confidence))
            .unwrap_or((0.85, 0.3));

        policy::resolve_action(
            evidence,
            policy_name,
            immediate_block_threshold,
            min_confidence,
            &self.config.action_policies,
            &self.config.bot_type_action_policies,
            self.config.bot_threshold,
            self.config.default_action_policy_name.as_deref(),
        )
    }

    fn build_wave_plan(&self, detection_policy: &DetectionPolicy) -> Vec<(WaveSpec, Vec<Arc<dyn Detector>>)> {
        let mut by_wave: std::collections::BTreeMap<Wave, Vec<Arc<dyn Detector>>> = std::collections::BTreeMap::new();
        for (name, wave, detector) in &self.registry {
            if detection_policy.excluded_detectors.contains(name) {
                continue;
            }
            if !detection_policy.detector_names.is_empty() && !detection_policy.detector_names.contains(name) {
                continue;
            }
            by_wave.entry(*wave).or_default().push(Arc::clone(detector));
        }

        by_wave
            .into_iter()
            .map(|(wave, detectors)| {
                (
                    WaveSpec {
                        wave,
                        timeout_ms: self.config.orchestrator.global_timeout_ms,
                        continue_on_wave_failure: true,
                    },
                    detectors,
                )
            })
            .collect()
    }

    fn update_caches(&self, signature: &str, evidence: &AggregatedEvidence, envelope: &RequestEnvelope, ctx: &RequestContext) {
        let now = Utc::now();
        let detection_event = DetectionEvent {
            signature: signature.to_string(),
            probability: evidence.bot_probability,
            confidence: evidence.confidence,
            risk_band: evidence.risk_band,
            action: evidence.triggered_action_policy_name.clone().unwrap_or_default(),
            country_code: ctx.country_code.clone(),
            processing_time_ms: evidence.total_processing_time_ms,
            bot_type: evidence.primary_bot_type.clone(),
            bot_name: evidence.primary_bot_name.clone(),
        };
        self.signature_cache.update_from_detection(&detection_event, now);

        let visitor_event = VisitorEvent {
            signature: signature.to_string(),
            path: envelope.path.clone(),
            processing_time_ms: evidence.total_processing_time_ms,
            request_id: envelope.request_id,
            bot_type: evidence.primary_bot_type.clone(),
            bot_name: evidence.primary_bot_name.clone(),
            user_agent: envelope.user_agent().to_string(),
        };
        self.visitor_cache.update_from_request(&visitor_event, now);
    }
}

fn allow() -> ActionOutcome {
    ActionOutcome {
        continue_request: true,
        status_code: None,
        body: None,
        response_headers: Vec::new(),
        action_kind: "Allow".to_string(),
    }
}
