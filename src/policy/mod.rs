//! The Policy Engine (§4.4): resolves a detection policy for a request,
//! then resolves an action policy for the aggregated evidence.

pub mod action;
pub mod detection;

pub use action::{resolve_action, ActionKind, ActionOutcome, ActionPolicy, ActionPolicyRegistry};
pub use detection::{
    apply_overlay, is_static_asset_path, resolve_policy_name, ApiKeyOverlay, DetectionPolicy,
    DetectionPolicyResolution, PathPolicyMap,
};
