/*!
 * Mock provider implementations for testing.
 *
 * This module provides a deterministic provider that simulates different
 * behaviors:
 * - `MockProvider::working()` - Always succeeds, echoing `[<target>] <text>`
 * - `MockProvider::failing()` - Always fails with an error
 * - `MockProvider::failing_on("needle")` - Fails only for chunks containing `needle`
 * - `MockProvider::intermittent(n)` - Fails every Nth request
 * - `MockProvider::slow(ms)` - Succeeds after a delay
 *
 * Every mock also counts calls, tracks how many calls are in flight per
 * `PromptContext::reference`, and can hold calls behind a gate until the
 * test releases them.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};

use crate::errors::ProviderError;
use crate::providers::{Generation, PromptContext, Provider};

/// Behavior mode for the mock provider
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Always succeeds with an echoed translation
    Working,
    /// Fails intermittently (every Nth request)
    Intermittent { fail_every: usize },
    /// Always fails with an error
    Failing,
    /// Fails when the chunk text contains the needle
    FailWhenSourceContains(String),
    /// Returns empty response
    Empty,
    /// Simulates slow response
    Slow { delay_ms: u64 },
}

/// In-flight bookkeeping shared between clones
#[derive(Debug, Default)]
struct Concurrency {
    in_flight: HashMap<String, usize>,
    max_per_reference: HashMap<String, usize>,
    total_in_flight: usize,
    max_total: usize,
}

/// Decrements the in-flight counters when a call ends or is cancelled
struct InFlightGuard {
    state: Arc<Mutex<Concurrency>>,
    reference: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&self.reference) {
            *count = count.saturating_sub(1);
        }
        state.total_in_flight = state.total_in_flight.saturating_sub(1);
    }
}

/// Mock provider for testing translation behavior
#[derive(Debug, Clone)]
pub struct MockProvider {
    /// Behavior mode, switchable while a run is in progress
    behavior: Arc<Mutex<MockBehavior>>,
    /// Request counter for intermittent failures
    request_count: Arc<AtomicUsize>,
    /// Broadcasts the number of calls started so far
    started: Arc<watch::Sender<usize>>,
    /// Per-reference concurrency tracking
    concurrency: Arc<Mutex<Concurrency>>,
    /// When set, every call waits for a permit before answering
    gate: Option<Arc<Semaphore>>,
    /// Custom response generator (optional)
    custom_response: Option<fn(&PromptContext) -> String>,
    /// Whether successful calls report token usage
    report_usage: bool,
}

impl MockProvider {
    /// Create a new mock provider with the specified behavior
    pub fn new(behavior: MockBehavior) -> Self {
        let (started, _) = watch::channel(0);
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            request_count: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(started),
            concurrency: Arc::new(Mutex::new(Concurrency::default())),
            gate: None,
            custom_response: None,
            report_usage: true,
        }
    }

    /// Create a working mock provider that always succeeds
    pub fn working() -> Self {
        Self::new(MockBehavior::Working)
    }

    /// Create an intermittently failing mock provider
    pub fn intermittent(fail_every: usize) -> Self {
        Self::new(MockBehavior::Intermittent { fail_every: fail_every.max(1) })
    }

    /// Create a failing mock provider that always errors
    pub fn failing() -> Self {
        Self::new(MockBehavior::Failing)
    }

    /// Create a mock that fails for chunks containing `needle`
    pub fn failing_on(needle: impl Into<String>) -> Self {
        Self::new(MockBehavior::FailWhenSourceContains(needle.into()))
    }

    /// Create a mock that returns empty responses
    pub fn empty() -> Self {
        Self::new(MockBehavior::Empty)
    }

    /// Create a mock that answers after `delay_ms`
    pub fn slow(delay_ms: u64) -> Self {
        Self::new(MockBehavior::Slow { delay_ms })
    }

    /// Hold every call until `release` hands out a permit
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Set a custom response generator
    pub fn with_custom_response(mut self, generator: fn(&PromptContext) -> String) -> Self {
        self.custom_response = Some(generator);
        self
    }

    /// Answer without token usage, like a server that omits counts
    pub fn without_usage(mut self) -> Self {
        self.report_usage = false;
        self
    }

    /// Change the behavior of this mock and all its clones
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Let `n` gated calls through
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Number of calls started so far
    pub fn calls(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` calls have started
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.started.subscribe();
        // The sender lives as long as self, so this only ends when the count is reached
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Highest number of simultaneous calls seen for one reference
    pub fn max_concurrency_for(&self, reference: &str) -> usize {
        self.concurrency
            .lock()
            .max_per_reference
            .get(reference)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous calls seen overall
    pub fn max_concurrency(&self) -> usize {
        self.concurrency.lock().max_total
    }

    /// Echo text the working mock produces for a chunk
    pub fn echo(target_language: &str, text: &str) -> String {
        format!("[{}] {}", target_language, text)
    }

    fn enter(&self, reference: &str) -> InFlightGuard {
        let mut state = self.concurrency.lock();
        let count = state.in_flight.entry(reference.to_string()).or_insert(0);
        *count += 1;
        let now = *count;
        let max = state.max_per_reference.entry(reference.to_string()).or_insert(0);
        *max = (*max).max(now);
        state.total_in_flight += 1;
        state.max_total = state.max_total.max(state.total_in_flight);

        InFlightGuard {
            state: Arc::clone(&self.concurrency),
            reference: reference.to_string(),
        }
    }

    fn success(&self, prompt: &PromptContext) -> Generation {
        let text = match self.custom_response {
            Some(generator) => generator(prompt),
            None => Self::echo(&prompt.target_language, &prompt.source_text),
        };
        if !self.report_usage {
            return Generation::new(text);
        }
        let completion_tokens = text.chars().count() as u64;
        Generation::new(text).with_usage(prompt.user_prompt.chars().count() as u64, completion_tokens)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(&self, prompt: PromptContext) -> Result<Generation, ProviderError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        let reference = prompt.reference.clone().unwrap_or_default();
        let _in_flight = self.enter(&reference);
        self.started.send_replace(count + 1);

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ProviderError::ConnectionError("mock gate closed".to_string()))?;
            permit.forget();
        }

        let behavior = self.behavior.lock().clone();
        match &behavior {
            MockBehavior::Working => Ok(self.success(&prompt)),

            MockBehavior::Intermittent { fail_every } => {
                if count % fail_every == fail_every - 1 {
                    Err(ProviderError::ApiError {
                        message: format!("Simulated intermittent failure (request #{})", count + 1),
                        status_code: 503,
                    })
                } else {
                    Ok(self.success(&prompt))
                }
            }

            MockBehavior::Failing => Err(ProviderError::ApiError {
                message: "Simulated provider failure".to_string(),
                status_code: 500,
            }),

            MockBehavior::FailWhenSourceContains(needle) => {
                if prompt.source_text.contains(needle.as_str()) {
                    Err(ProviderError::ApiError {
                        message: format!("Simulated failure for chunk containing '{}'", needle),
                        status_code: 500,
                    })
                } else {
                    Ok(self.success(&prompt))
                }
            }

            MockBehavior::Empty => Ok(Generation::new(String::new()).with_usage(0, 0)),

            MockBehavior::Slow { delay_ms } => {
                tokio::time::sleep(tokio::time::Duration::from_millis(*delay_ms)).await;
                Ok(self.success(&prompt))
            }
        }
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        match *self.behavior.lock() {
            MockBehavior::Failing => Err(ProviderError::ConnectionError("Simulated connection failure".to_string())),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
