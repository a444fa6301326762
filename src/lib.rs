//! # botshield-core
//!
//! In-process bot detection engine embedded as HTTP middleware: a blackboard
//! orchestrator runs detectors in parallel waves, an evidence aggregator
//! turns their contributions into a bot probability, and a policy engine
//! decides what to do about it.
//!
//! ## Core components
//!
//! - **Orchestrator**: wave-based parallel detector scheduling with
//!   circuit breakers and quorum-based early exit
//! - **Aggregator**: turns a detection ledger into a bot probability,
//!   confidence, and risk band
//! - **Policy**: detection-policy and action-policy resolution
//! - **Signature**: keyed-MAC identity fingerprinting and aggregate caches

pub mod aggregator;
pub mod blackboard;
pub mod config;
pub mod detector;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod export;
pub mod feedback;
pub mod ledger;
pub mod llm_provider;
pub mod orchestrator;
pub mod policy;
pub mod signature;
pub mod sink;
pub mod upstream_trust;

pub use aggregator::{AggregatedEvidence, CategoryScore, EvidencePattern, RiskBand, WeightOverrides};
pub use blackboard::Blackboard;
pub use config::{AllowListConfig, EngineConfig, FastPathConfig, ResponseHeadersConfig, ThrottlingConfig};
pub use detector::{Category, Contribution, Detector, DetectorMeta, Verdict, Wave};
pub use engine::{Engine, PipelineOutcome, RequestContext};
pub use envelope::{AuthenticatedUser, Headers, Method, RequestEnvelope, ScratchMap};
pub use error::{Error, Result, TimeoutScope};
pub use export::{build_export_record, derive_label, filter_signals_for_export, generalize_path, TrainingExportRecord};
pub use feedback::{apply_response_feedback, FeedbackRule, ResponseFeedbackConfig, ResponseSignal};
pub use ledger::DetectionLedger;
pub use llm_provider::{capability_enabled, CompletionParams, LlmProvider};
pub use orchestrator::{
    CircuitBreakerConfig, CircuitBreakerSnapshot, DetectionOutcome, EarlyExitVerdict,
    Orchestrator, OrchestratorConfig, OrchestratorConfigBuilder, WaveSpec,
};
pub use policy::{
    apply_overlay, is_static_asset_path, resolve_action, resolve_policy_name, ActionKind,
    ActionOutcome, ActionPolicy, ActionPolicyRegistry, ApiKeyOverlay, DetectionPolicy,
    DetectionPolicyResolution, PathPolicyMap,
};
pub use signature::{
    derive_signatures, fuzzy_match_weight, is_match, ClientSideFingerprint, FactorWeights, MacKey,
    PluginFingerprint, SignatureSet,
};
pub use signature::cache::{
    BotSummary, DetectionEvent, SharedSignatureAggregateCache, SignatureAggregate,
    SignatureAggregateCache, TopBotsSort,
};
pub use signature::visitor::{CachedVisitor, CategoryCounts, VisitorCategory, VisitorEvent, VisitorListCache};
pub use sink::{RetainedSignal, SignalSink, DEFAULT_MAX_SIGNAL_CAPACITY, DEFAULT_SIGNAL_RETENTION_MINUTES};
pub use upstream_trust::{try_hydrate, UpstreamTrustConfig};
