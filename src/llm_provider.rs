//! `LlmProvider` (§9 "Reflection-based LLM dispatch in the source must
//! go"): an explicit interface for the one AI-backed detector wave,
//! registered at composition root rather than discovered by reflection.
//! Absence of a provider disables the AI capability rather than failing
//! the request.

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Parameters for one completion call. Intentionally minimal — the
/// engine only ever asks an LLM to classify one request, never to chat.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 256,
            temperature: 0.0,
        }
    }
}

/// Explicit LLM dispatch interface (§9). Implementors wrap whatever
/// concrete provider SDK the host wires in; the engine never depends on
/// a specific one.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str, params: &CompletionParams, cancel: &CancellationToken) -> Result<String>;
}

/// The AI detector wave is disabled when no provider is registered
/// (§9 "absence of provider -> capability disabled flag"), rather than
/// treated as a configuration error.
pub fn capability_enabled(provider: &Option<Box<dyn LlmProvider>>) -> bool {
    provider.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn complete(&self, prompt: &str, _params: &CompletionParams, _cancel: &CancellationToken) -> Result<String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn complete(&self, _prompt: &str, _params: &CompletionParams, _cancel: &CancellationToken) -> Result<String> {
            Err(Error::internal("provider unreachable"))
        }
    }

    #[tokio::test]
    async fn provider_completes_and_returns_text() {
        let provider = EchoProvider;
        let cancel = CancellationToken::new();
        let result = provider.complete("is this a bot?", &CompletionParams::default(), &cancel).await.unwrap();
        assert_eq!(result, "echo: is this a bot?");
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_result_not_panic() {
        let provider = FailingProvider;
        let cancel = CancellationToken::new();
        assert!(provider.complete("x", &CompletionParams::default(), &cancel).await.is_err());
    }

    #[test]
    fn no_provider_disables_the_capability() {
        let provider: Option<Box<dyn LlmProvider>> = None;
        assert!(!capability_enabled(&provider));
        let provider: Option<Box<dyn LlmProvider>> = Some(Box::new(EchoProvider));
        assert!(capability_enabled(&provider));
    }
}
