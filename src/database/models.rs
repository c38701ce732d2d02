/*!
 * Database entity models and DTOs.
 *
 * These structures map directly to database tables and provide
 * type-safe access to persisted sessions and chunks.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created, no source text yet
    Draft,
    /// Source text split into chunks, ready to run
    Ready,
    /// A bulk run is scheduling chunks
    Translating,
    /// Scheduling stopped; resumable
    Paused,
    /// Every chunk translated and the document assembled
    Completed,
    /// The orchestrator gave up on the session
    Failed,
}

impl SessionStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Draft,
        SessionStatus::Ready,
        SessionStatus::Translating,
        SessionStatus::Paused,
        SessionStatus::Completed,
        SessionStatus::Failed,
    ];

    /// Check if the session reached a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Draft => write!(f, "draft"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Translating => write!(f, "translating"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(SessionStatus::Draft),
            "ready" => Ok(SessionStatus::Ready),
            "translating" => Ok(SessionStatus::Translating),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid session status: {}", s)),
        }
    }
}

/// Translation status for individual chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Chunk awaiting translation
    Pending,
    /// Chunk claimed by a worker, provider call in flight
    Processing,
    /// Chunk translated
    Completed,
    /// Provider call failed
    Failed,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkStatus::Pending => write!(f, "pending"),
            ChunkStatus::Processing => write!(f, "processing"),
            ChunkStatus::Completed => write!(f, "completed"),
            ChunkStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ChunkStatus::Pending),
            "processing" => Ok(ChunkStatus::Processing),
            "completed" => Ok(ChunkStatus::Completed),
            "failed" => Ok(ChunkStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid chunk status: {}", s)),
        }
    }
}

/// Translation session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session identifier (UUID)
    pub id: String,
    /// Human readable title
    pub title: String,
    /// Free-form note
    pub memo: Option<String>,
    /// `source=target` lines injected into every prompt
    pub custom_dictionary: Option<String>,
    /// Name of the uploaded file, if the source came from a file
    pub original_filename: Option<String>,
    /// Full source text
    pub source_text: Option<String>,
    /// SHA256 hash of the source text
    pub source_hash: Option<String>,
    /// Assembled translation, only set while completed
    pub translated_text: Option<String>,
    /// Current session status
    pub status: SessionStatus,
    /// Number of chunks owned by the session
    pub total_chunks: i64,
    /// Creation timestamp (ISO 8601)
    pub created_at: String,
    /// Last update timestamp (ISO 8601)
    pub updated_at: String,
    /// Completion timestamp (ISO 8601), if completed
    pub completed_at: Option<String>,
}

impl SessionRecord {
    /// Create a new draft session record
    pub fn new(id: String, title: String) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            title,
            memo: None,
            custom_dictionary: None,
            original_filename: None,
            source_text: None,
            source_hash: None,
            translated_text: None,
            status: SessionStatus::Draft,
            total_chunks: 0,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        }
    }

    /// Short id for log lines
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    /// Check if session is resumable
    pub fn is_resumable(&self) -> bool {
        matches!(self.status, SessionStatus::Translating | SessionStatus::Paused)
    }
}

/// A chunk of source text scheduled for independent translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Database ID
    pub id: i64,
    /// Owning session
    pub session_id: String,
    /// Zero-based position in the session
    pub order: i64,
    /// Source text of this chunk
    pub source_text: String,
    /// Translated text, set iff completed
    pub translated_text: Option<String>,
    /// Current status
    pub status: ChunkStatus,
    /// Last provider error, if failed
    pub error_message: Option<String>,
    /// Number of explicit retries
    pub retry_count: i64,
    /// Tokens reported by the provider
    pub token_count: Option<i64>,
    /// Wall time of the last provider call in milliseconds
    pub duration_ms: Option<i64>,
    /// Creation timestamp
    pub created_at: String,
    /// Last update timestamp
    pub updated_at: String,
}

/// Chunk row to insert during ingestion
#[derive(Debug, Clone)]
pub struct NewChunk {
    /// Zero-based position
    pub order: i64,
    /// Source text
    pub source_text: String,
}

impl NewChunk {
    pub fn new(order: i64, source_text: impl Into<String>) -> Self {
        Self { order, source_text: source_text.into() }
    }
}

/// Source text attached to a session during ingestion
#[derive(Debug, Clone)]
pub struct SourceAttachment {
    /// Full source text
    pub text: String,
    /// SHA256 hash of the text
    pub hash: String,
    /// Uploaded file name, if any
    pub original_filename: Option<String>,
}

/// Editable session fields; `None` leaves the field untouched
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// New title
    pub title: Option<String>,
    /// New memo; `Some(None)` clears it
    pub memo: Option<Option<String>>,
    /// New dictionary; `Some(None)` clears it
    pub custom_dictionary: Option<Option<String>>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.memo.is_none() && self.custom_dictionary.is_none()
    }
}

/// One page of chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPage {
    /// Chunks on this page, ascending order
    pub items: Vec<ChunkRecord>,
    /// Zero-based page index
    pub page: usize,
    /// Page size used
    pub page_size: usize,
    /// Number of chunks matching the filter
    pub total: usize,
}

impl ChunkPage {
    /// Number of pages for this filter
    pub fn page_count(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size)
    }
}

/// Work reset by interrupted-run recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions moved from translating to paused
    pub sessions_paused: usize,
    /// Chunks moved from processing back to pending
    pub chunks_requeued: usize,
}
