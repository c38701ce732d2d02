use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::errors::ProviderError;

use super::{Generation, PromptContext, Provider, RetryPolicy};

/// Ollama client for interacting with Ollama API
#[derive(Debug)]
pub struct Ollama {
    /// Base URL of the Ollama API
    base_url: String,
    /// Model name to use for generation
    model: String,
    /// HTTP client for making requests
    client: Client,
    /// Transient failure retries
    retry: RetryPolicy,
    /// Optional rate limit in requests per minute
    rate_limit: Option<u32>,
    /// When the last request was sent, for rate limiting
    last_request: Mutex<Option<Instant>>,
}

/// Generate request for the Ollama API
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model name to use for generation
    model: String,
    /// Prompt to generate from
    prompt: String,
    /// System message to guide the model
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    /// Additional model parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerationOptions>,
    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

/// Generation options for the Ollama API
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Temperature for generation (default: 0.8)
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Generation response from the Ollama API
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Model name
    #[serde(default)]
    pub model: String,
    /// Generated text
    #[serde(default)]
    pub response: String,
    /// Whether the generation is complete
    #[serde(default)]
    pub done: bool,
    /// Number of prompt tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    /// Number of generated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
}

impl GenerationRequest {
    /// Create a new generation request
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            options: None,
            stream: Some(false),
        }
    }

    /// Set the system prompt
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the temperature
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.options = Some(GenerationOptions { temperature: Some(temperature) });
        self
    }
}

impl GenerationResponse {
    /// Parse a response body.
    ///
    /// Ollama answers with a single JSON object when `stream` is false, but
    /// some proxies still forward the JSONL stream; in that case the pieces
    /// are concatenated and the counters come from the final `done` line.
    pub fn parse(body: &str) -> Result<Self, ProviderError> {
        if let Ok(response) = serde_json::from_str::<GenerationResponse>(body) {
            return Ok(response);
        }

        let mut text = String::new();
        let mut last: Option<GenerationResponse> = None;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let piece: GenerationResponse = serde_json::from_str(line).map_err(|e| {
                ProviderError::ParseError(format!("invalid Ollama response line: {}", e))
            })?;
            text.push_str(&piece.response);
            last = Some(piece);
        }

        let mut last = last.ok_or_else(|| ProviderError::ParseError("empty Ollama response".to_string()))?;
        last.response = text;
        last.done = true;
        Ok(last)
    }
}

impl Ollama {
    /// Create a new Ollama client with configuration
    ///
    /// Ollama speaks HTTP/1.1; idle connections are pooled so parallel chunk
    /// requests reuse sockets.
    pub fn new_with_config(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
        retry: RetryPolicy,
        rate_limit: Option<u32>,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        let url = Url::parse(&endpoint).map_err(|e| anyhow!("Invalid Ollama endpoint '{}': {}", endpoint, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("Ollama endpoint must use http or https: {}", endpoint));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .http1_only()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            base_url: url.as_str().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
            retry,
            rate_limit: rate_limit.filter(|r| *r > 0),
            last_request: Mutex::new(None),
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Wait until the configured rate limit allows another request
    async fn throttle(&self) {
        let Some(rate_limit) = self.rate_limit else {
            return;
        };
        let interval = Duration::from_millis(60_000 / rate_limit as u64);

        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Send one generate request without retrying
    async fn generate_once(&self, request: &GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        self.throttle().await;

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(format!("Failed to send request to Ollama API: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::RequestFailed(format!("Failed to read Ollama response: {}", e)))?;

        if !status.is_success() {
            error!("Ollama API error ({}): {}", status, body);
            return Err(ProviderError::ApiError {
                status_code: status.as_u16(),
                message: body,
            });
        }

        GenerationResponse::parse(&body)
    }

    /// Get the Ollama API version
    pub async fn version(&self) -> Result<String, ProviderError> {
        let url = format!("{}/api/version", self.base_url);
        let response: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(format!("Failed to connect to Ollama: {}", e)))?
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(format!("Failed to parse Ollama version response: {}", e)))?;

        response["version"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::ParseError("Invalid version format in response".to_string()))
    }
}

#[async_trait]
impl Provider for Ollama {
    async fn generate(&self, prompt: PromptContext) -> Result<Generation, ProviderError> {
        let request = GenerationRequest::new(&self.model, prompt.user_prompt)
            .system(prompt.system_prompt)
            .temperature(prompt.temperature);

        let response = self
            .retry
            .run("Ollama", || self.generate_once(&request))
            .await?;

        debug!(
            "Ollama generated {} chars (prompt tokens {:?}, completion tokens {:?})",
            response.response.chars().count(),
            response.prompt_eval_count,
            response.eval_count
        );

        let mut generation = Generation::new(response.response);
        if response.prompt_eval_count.is_some() || response.eval_count.is_some() {
            generation = generation.with_usage(
                response.prompt_eval_count.unwrap_or(0),
                response.eval_count.unwrap_or(0),
            );
        }
        Ok(generation)
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let version = self.version().await?;
        debug!("Connected to Ollama {} at {}", version, self.base_url);
        Ok(())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
