/*!
 * # chunkwise - chunked long-text translation
 *
 * A Rust library that translates long documents by splitting them into
 * ordered chunks, sending each chunk to a generation provider and
 * assembling the result, with durable progress, pause/resume and
 * per-chunk retry.
 *
 * ## Features
 *
 * - Size-bounded chunking on paragraph, line and sentence boundaries
 * - Translation through various providers:
 *   - Ollama (local LLM)
 *   - Anthropic API
 *   - A deterministic mock for tests
 * - Sessions persisted in SQLite, resumable after a crash
 * - Bounded concurrency with cooperative pause
 * - Live per-session progress events
 * - Custom dictionaries injected into every prompt
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `app_config`: Configuration management
 * - `database`: SQLite persistence of sessions and chunks
 * - `translation`: The chunked translation engine:
 *   - `translation::splitter`: Chunk splitting
 *   - `translation::orchestrator`: Session commands and bulk runs
 *   - `translation::events`: Per-session event bus
 * - `session`: Session inputs and summaries
 * - `providers`: Client implementations for generation providers
 * - `file_utils`: File system operations
 * - `app_controller`: Command line controller
 * - `language_utils`: ISO language code utilities
 * - `errors`: Custom error types for the application
 */

// Global lints configuration
// These lints will be allowed but not auto-fixed
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

// Public modules
pub mod app_config;
pub mod app_controller;
pub mod database;
pub mod errors;
pub mod file_utils;
pub mod language_utils;
pub mod providers;
pub mod session;
pub mod translation;

// Re-export main types for easier usage
pub use app_config::Config;
pub use database::{SessionRepository, SqliteRepository};
pub use errors::{AppError, EngineError, EngineResult, ProviderError, RepositoryError};
pub use language_utils::{get_language_name, language_codes_match, normalize_to_part2t};
pub use translation::{Orchestrator, Progress, TemplateContext, TranslationEvent};
