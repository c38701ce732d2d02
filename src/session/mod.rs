/*!
 * Session inputs and summaries.
 *
 * This module provides:
 * - Parameters for creating a session and feeding it source text
 * - Display summaries combining a session with its progress
 * - The resume decision used when the same source is translated again
 */

pub mod models;

// Re-export main types
pub use models::{ResumePlan, SessionCreateParams, SessionInfo, SourceInput};
