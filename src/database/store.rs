/*!
 * Repository capability consumed by the orchestrator.
 *
 * The orchestrator never talks to SQLite directly; it receives an
 * `Arc<dyn SessionRepository>` so tests and embedders can substitute
 * their own store. Every mutation is conditional: an update against a
 * row that vanished reports `NotFound`, an update against a row in an
 * unexpected state reports `Conflict`.
 */

use async_trait::async_trait;

use crate::errors::RepositoryError;

use super::models::{
    ChunkPage, ChunkRecord, ChunkStatus, NewChunk, RecoveryReport, SessionRecord,
    SessionStatus, SessionUpdate, SourceAttachment,
};

/// Result type for repository operations
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Durable store of sessions and their ordered chunks
#[async_trait]
pub trait SessionRepository: Send + Sync {
    // Sessions

    /// Insert a new session
    async fn create_session(&self, session: &SessionRecord) -> RepoResult<()>;

    /// Get a session by ID
    async fn get_session(&self, session_id: &str) -> RepoResult<Option<SessionRecord>>;

    /// List sessions, most recently updated first
    async fn list_sessions(&self, status: Option<SessionStatus>) -> RepoResult<Vec<SessionRecord>>;

    /// Most recent session built from the given source hash
    async fn find_session_by_source_hash(&self, source_hash: &str) -> RepoResult<Option<SessionRecord>>;

    /// Apply editable field changes
    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> RepoResult<SessionRecord>;

    /// Move a session to `next` if its status is one of `expected`.
    ///
    /// Leaving `completed` clears the assembled translation.
    async fn transition_session(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> RepoResult<SessionRecord>;

    /// Store the assembled translation and mark the session completed
    async fn complete_session(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        translated_text: &str,
    ) -> RepoResult<SessionRecord>;

    /// Attach source text and replace all chunks in one transaction; the
    /// session moves to `ready` with `total_chunks = chunks.len()`.
    async fn replace_chunks(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        source: &SourceAttachment,
        chunks: Vec<NewChunk>,
    ) -> RepoResult<SessionRecord>;

    /// Delete a session and, by cascade, its chunks. Returns whether a row
    /// was removed.
    async fn delete_session(&self, session_id: &str) -> RepoResult<bool>;

    // Chunks

    /// All chunks of a session in ascending order
    async fn list_chunks(&self, session_id: &str) -> RepoResult<Vec<ChunkRecord>>;

    /// One zero-based page of chunks, optionally filtered by status
    async fn list_chunks_page(
        &self,
        session_id: &str,
        page: usize,
        page_size: usize,
        status: Option<ChunkStatus>,
    ) -> RepoResult<ChunkPage>;

    /// Get a chunk by ID
    async fn get_chunk(&self, chunk_id: i64) -> RepoResult<Option<ChunkRecord>>;

    /// Atomically mark a chunk `processing` if its status is one of
    /// `expected` and its session is in one of `session_states`. Clears any
    /// previous output; `bump_retry` increments the retry counter in the
    /// same statement.
    async fn claim_chunk(
        &self,
        chunk_id: i64,
        expected: &[ChunkStatus],
        session_states: &[SessionStatus],
        bump_retry: bool,
    ) -> RepoResult<ChunkRecord>;

    /// Record a successful translation of a `processing` chunk
    async fn complete_chunk(
        &self,
        chunk_id: i64,
        translated_text: &str,
        token_count: Option<i64>,
        duration_ms: i64,
    ) -> RepoResult<ChunkRecord>;

    /// Record a failed translation of a `processing` chunk
    async fn fail_chunk(
        &self,
        chunk_id: i64,
        error_message: &str,
        duration_ms: i64,
    ) -> RepoResult<ChunkRecord>;

    /// Move every failed chunk of a session back to pending, incrementing
    /// its retry counter. Returns the number of chunks reset.
    async fn requeue_failed_chunks(&self, session_id: &str) -> RepoResult<usize>;

    /// Reset every chunk of a session to a fresh pending state
    async fn reset_chunks(&self, session_id: &str) -> RepoResult<usize>;

    /// Requeue chunks and pause sessions left mid-run by a previous process
    async fn recover_interrupted(&self) -> RepoResult<RecoveryReport>;
}
