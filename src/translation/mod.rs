/*!
 * Chunked translation engine.
 *
 * This module contains everything between a session's source text and its
 * assembled translation. It is split into several submodules:
 *
 * - `splitter`: Splits source text into ordered, size-bounded chunks
 * - `dictionary`: Parses the session's custom dictionary
 * - `prompts`: Prompt templates and per-chunk rendering
 * - `progress`: Progress aggregation over chunk statuses
 * - `events`: Per-session event fan-out
 * - `guards`: Legal session and chunk transitions
 * - `run`: Bulk run scheduling and per-chunk execution
 * - `orchestrator`: The command surface
 */

use serde::{Deserialize, Serialize};

// Submodules
pub mod dictionary;
pub mod events;
pub mod guards;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
mod run;
pub mod splitter;
pub mod tokens;

// Re-export main types for easier usage
pub use self::dictionary::CustomDictionary;
pub use self::events::{EventBus, RunLease, Subscription, TranslationEvent};
pub use self::orchestrator::Orchestrator;
pub use self::progress::Progress;
pub use self::prompts::{PromptTemplate, TemplateContext};
pub use self::splitter::split_text;
pub use self::tokens::TokenCounter;

/// What happens to a session when its run drains with failed chunks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the session if the run completed no chunk at all, pause it
    /// otherwise
    #[default]
    FailWhenStalled,
    /// Always pause, leaving failed chunks for an explicit retry
    Hold,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::FailWhenStalled => write!(f, "fail_when_stalled"),
            FailurePolicy::Hold => write!(f, "hold"),
        }
    }
}
