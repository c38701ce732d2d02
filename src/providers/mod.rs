/*!
 * Generation providers.
 *
 * This module contains client implementations for the supported backends:
 * - Ollama: Local LLM server
 * - Anthropic: Anthropic Messages API
 * - Mock: deterministic in-process provider for dry runs and tests
 *
 * The orchestrator only sees `Arc<dyn Provider>`, so every adapter maps its
 * wire format onto `PromptContext` / `Generation`.
 */

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;

use crate::app_config::{TranslationConfig, TranslationProvider};
use crate::errors::ProviderError;

pub mod anthropic;
pub mod mock;
pub mod ollama;

/// Everything a provider needs to translate one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    /// Rendered system prompt
    pub system_prompt: String,
    /// Rendered user prompt, chunk text included
    pub user_prompt: String,
    /// Raw chunk text
    pub source_text: String,
    /// Source language name
    pub source_language: String,
    /// Target language name
    pub target_language: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Opaque caller reference (the orchestrator uses `<session>:<order>`)
    pub reference: Option<String>,
}

/// Token accounting reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Generated text
    pub text: String,
    /// Token usage, if the backend reports it
    pub token_usage: Option<TokenUsage>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), token_usage: None }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.token_usage = Some(TokenUsage { prompt_tokens, completion_tokens });
        self
    }
}

/// Common trait for all generation providers
///
/// Implementations must be usable behind `Arc<dyn Provider>` and from many
/// tasks at once.
#[async_trait]
pub trait Provider: Send + Sync + Debug {
    /// Generate the translation of one chunk
    async fn generate(&self, prompt: PromptContext) -> Result<Generation, ProviderError>;

    /// Test the connection to the provider
    async fn test_connection(&self) -> Result<(), ProviderError>;

    /// Short provider name for logs
    fn name(&self) -> &str;
}

/// Retry settings for transient transport failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Base delay, doubled after each attempt
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base_ms: u64) -> Self {
        Self { max_retries, backoff_base_ms }
    }

    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Run `attempt` until it succeeds, fails permanently or retries run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut tries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tries < self.max_retries => {
                    tries += 1;
                    let backoff_ms = self.backoff_base_ms.saturating_mul(1u64 << (tries - 1).min(16));
                    debug!(
                        "{} transient failure ({}), attempt {}/{}, retrying in {}ms",
                        label,
                        e,
                        tries,
                        self.max_retries + 1,
                        backoff_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the configured provider
pub fn create_provider(config: &TranslationConfig) -> Result<Arc<dyn Provider>> {
    let retry = RetryPolicy::new(config.common.retry_count, config.common.retry_backoff_ms);

    let provider: Arc<dyn Provider> = match config.provider {
        TranslationProvider::Ollama => Arc::new(ollama::Ollama::new_with_config(
            config.get_endpoint(),
            config.get_model(),
            config.get_timeout_secs(),
            retry,
            config.get_rate_limit(),
        )?),
        TranslationProvider::Anthropic => {
            let api_key = config.get_api_key();
            if api_key.is_empty() {
                return Err(anyhow!("Anthropic provider requires an API key"));
            }
            Arc::new(anthropic::Anthropic::new_with_config(
                api_key,
                config.get_endpoint(),
                config.get_model(),
                config.get_timeout_secs(),
                retry,
            ))
        }
        TranslationProvider::Mock => Arc::new(mock::MockProvider::working()),
    };

    Ok(provider)
}
