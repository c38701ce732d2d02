/*!
 * Session-level inputs and summaries.
 *
 * These structures sit between callers and the orchestrator: what a
 * caller hands in to create or feed a session, and the summaries the CLI
 * prints about it.
 */

use serde::{Deserialize, Serialize};

use crate::database::models::{SessionRecord, SessionStatus};
use crate::errors::{EngineError, EngineResult};
use crate::translation::progress::Progress;

/// Parameters for creating a new session
#[derive(Debug, Clone, Default)]
pub struct SessionCreateParams {
    /// Human readable title
    pub title: String,
    /// Free-form note
    pub memo: Option<String>,
    /// `source=target` lines
    pub custom_dictionary: Option<String>,
}

impl SessionCreateParams {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_dictionary(mut self, dictionary: impl Into<String>) -> Self {
        self.custom_dictionary = Some(dictionary.into());
        self
    }
}

/// Source handed to `ingest_source`
#[derive(Debug, Clone)]
pub enum SourceInput {
    /// Plain text
    Text(String),
    /// Raw bytes of an uploaded file, expected to be UTF-8
    File { filename: String, bytes: Vec<u8> },
}

impl SourceInput {
    /// Decode into text and the original filename, rejecting blank input
    pub fn decode(self) -> EngineResult<(String, Option<String>)> {
        let (text, filename) = match self {
            SourceInput::Text(text) => (text, None),
            SourceInput::File { filename, bytes } => {
                let text = String::from_utf8(bytes).map_err(|e| {
                    EngineError::Validation(format!("{} is not valid UTF-8: {}", filename, e))
                })?;
                (text, Some(filename))
            }
        };

        let text = match text.strip_prefix('\u{FEFF}') {
            Some(stripped) => stripped.to_string(),
            None => text,
        };

        if text.trim().is_empty() {
            return Err(EngineError::Validation("source text is empty".to_string()));
        }
        Ok((text, filename))
    }
}

/// High-level session information for display and tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    pub original_filename: Option<String>,
    pub status: SessionStatus,
    pub progress: Progress,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl SessionInfo {
    /// Create from a session record and its current progress
    pub fn from_record(record: &SessionRecord, progress: Progress) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            original_filename: record.original_filename.clone(),
            status: record.status,
            progress,
            created_at: record.created_at.clone(),
            updated_at: record.updated_at.clone(),
            completed_at: record.completed_at.clone(),
        }
    }

    /// Get a human-readable status string
    pub fn status_display(&self) -> &'static str {
        match self.status {
            SessionStatus::Draft => "Draft",
            SessionStatus::Ready => "Ready",
            SessionStatus::Translating => "Translating",
            SessionStatus::Paused => "Paused",
            SessionStatus::Completed => "Completed",
            SessionStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({}, {})",
            &self.id[..8.min(self.id.len())],
            self.title,
            self.status_display(),
            self.progress
        )
    }
}

/// What to do with a session previously built from the same source
#[derive(Debug, Clone)]
pub enum ResumePlan {
    /// No usable session; create and ingest a new one
    Fresh,
    /// Ingested but never run
    Start(SessionRecord),
    /// Stopped mid-run
    Resume(SessionRecord),
    /// Gave up on failed chunks; requeue them
    RetryFailed(SessionRecord),
    /// Already translated
    AlreadyCompleted(SessionRecord),
}

impl ResumePlan {
    /// Decide how to continue from an existing session, if any
    pub fn for_existing(existing: Option<SessionRecord>) -> Self {
        let Some(session) = existing else {
            return ResumePlan::Fresh;
        };
        match session.status {
            SessionStatus::Draft => ResumePlan::Fresh,
            SessionStatus::Ready => ResumePlan::Start(session),
            SessionStatus::Translating | SessionStatus::Paused => ResumePlan::Resume(session),
            SessionStatus::Failed => ResumePlan::RetryFailed(session),
            SessionStatus::Completed => ResumePlan::AlreadyCompleted(session),
        }
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        match self {
            ResumePlan::Fresh => None,
            ResumePlan::Start(s)
            | ResumePlan::Resume(s)
            | ResumePlan::RetryFailed(s)
            | ResumePlan::AlreadyCompleted(s) => Some(s),
        }
    }
}
