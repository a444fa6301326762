//! Error types for botshield-core.

use thiserror::Error;

/// Result type alias using botshield-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// A single detector's own timeout.
    Detector,
    /// A wave's `WaveTimeoutMs`.
    Wave,
    /// The whole request's `TimeoutMs`.
    Global,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detector => write!(f, "detector"),
            Self::Wave => write!(f, "wave"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Errors that can occur during engine operation.
///
/// Per spec, runtime errors inside detectors, action policies, and the
/// feedback callback must never propagate out of the middleware as a
/// panic or unhandled `Err` that blocks the request. Only configuration
/// errors are allowed to be fatal, and only at startup.
#[derive(Error, Debug)]
pub enum Error {
    /// Detected at startup; fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Per-call detector failure; absorbed and recorded as a ledger reason.
    #[error("detector {name} failed: {reason}")]
    DetectorFailure { name: String, reason: String },

    /// Detector/wave/global deadline expired.
    #[error("{scope} timeout exceeded after {duration_ms}ms")]
    Timeout {
        scope: TimeoutScope,
        duration_ms: u64,
    },

    /// Cooperative cancellation observed.
    #[error("cancelled")]
    Cancelled,

    /// Upstream-trust header verification failed; caller must fall
    /// through to local detection.
    #[error("upstream trust rejected: {reason}")]
    UpstreamTrustRejected { reason: String },

    /// An action policy failed to execute; caller falls back to allow.
    #[error("action policy {policy} failed: {reason}")]
    ActionPolicyExecutionFailed { policy: String, reason: String },

    /// The response-feedback callback failed; logged only.
    #[error("feedback callback failed: {0}")]
    FeedbackCallbackFailed(String),

    /// A cache invariant was violated; logged and repaired in place.
    #[error("cache integrity violation: {0}")]
    CacheIntegrityViolation(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Precondition violation inside the orchestrator itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn detector_failure(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DetectorFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(scope: TimeoutScope, duration_ms: u64) -> Self {
        Self::Timeout { scope, duration_ms }
    }

    pub fn upstream_trust_rejected(reason: impl Into<String>) -> Self {
        Self::UpstreamTrustRejected {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
