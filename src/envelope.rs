//! The request envelope: the external HTTP request reduced to what the
//! engine needs, plus a per-request scratch map for cross-component state.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// An HTTP method, kept as a small owned string rather than re-exporting a
/// web-framework type — the engine has no dependency on any particular
/// HTTP server.
pub type Method = String;

/// Case-insensitive request headers.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An authenticated user identity, if the request carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
}

/// Stable well-known scratch keys (§6 "Request scratch keys").
pub mod scratch_keys {
    pub const AGGREGATED_EVIDENCE: &str = "AggregatedEvidence";
    pub const IS_BOT: &str = "IsBot";
    pub const BOT_PROBABILITY: &str = "BotProbability";
    pub const DETECTION_CONFIDENCE: &str = "DetectionConfidence";
    pub const BOT_TYPE: &str = "BotType";
    pub const BOT_NAME: &str = "BotName";
    pub const BOT_CATEGORY: &str = "BotCategory";
    pub const POLICY_NAME: &str = "PolicyName";
    pub const POLICY_ACTION: &str = "PolicyAction";
    pub const SIGNATURES: &str = "Signatures";
    pub const API_KEY_CONTEXT: &str = "ApiKeyContext";
}

/// Per-request scratch map shared between the engine and downstream
/// handlers. Backed by `DashMap` so concurrent detector reads/writes
/// within one request don't need an explicit lock.
#[derive(Debug, Default)]
pub struct ScratchMap {
    inner: DashMap<String, Value>,
}

impl ScratchMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|v| v.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }
}

/// The reduced external HTTP request.
pub struct RequestEnvelope {
    pub request_id: Uuid,
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub connection_ip: String,
    pub authenticated_user: Option<AuthenticatedUser>,
    pub cancellation: CancellationToken,
    pub scratch: ScratchMap,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>, connection_ip: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            connection_ip: connection_ip.into(),
            authenticated_user: None,
            cancellation: CancellationToken::new(),
            scratch: ScratchMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn user_agent(&self) -> &str {
        self.headers.get("user-agent").unwrap_or("")
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let mut h = Headers::new();
        h.insert("User-Agent", "curl/8.0");
        assert_eq!(h.get("user-agent"), Some("curl/8.0"));
        assert_eq!(h.get("USER-AGENT"), Some("curl/8.0"));
    }

    #[test]
    fn scratch_map_roundtrips_values() {
        let scratch = ScratchMap::new();
        scratch.set(scratch_keys::BOT_PROBABILITY, 0.42);
        assert!(scratch.has(scratch_keys::BOT_PROBABILITY));
        assert_eq!(scratch.get(scratch_keys::BOT_PROBABILITY), Some(Value::from(0.42)));
        assert!(!scratch.has("missing"));
    }
}
