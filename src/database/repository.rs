/*!
 * SQLite implementation of the session repository.
 *
 * All SQL lives here. Every conditional mutation (status transitions,
 * chunk claims, result writes) reads and writes inside one transaction
 * while holding the connection lock, so two callers can never both win
 * the same claim.
 */

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::errors::RepositoryError;

use super::connection::DatabaseConnection;
use super::models::{
    ChunkPage, ChunkRecord, ChunkStatus, NewChunk, RecoveryReport, SessionRecord,
    SessionStatus, SessionUpdate, SourceAttachment,
};
use super::store::{RepoResult, SessionRepository};

const SESSION_COLUMNS: &str = "id, title, memo, custom_dictionary, original_filename, source_text, \
     source_hash, translated_text, status, total_chunks, created_at, updated_at, completed_at";

const CHUNK_COLUMNS: &str = "id, session_id, chunk_order, source_text, translated_text, status, \
     error_message, retry_count, token_count, duration_ms, created_at, updated_at";

/// Repository backed by a SQLite database
#[derive(Clone)]
pub struct SqliteRepository {
    /// Database connection
    db: DatabaseConnection,
}

impl SqliteRepository {
    /// Create a new repository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a repository with the default database location
    pub fn new_default() -> Result<Self> {
        let db = DatabaseConnection::new_default()?;
        Ok(Self::new(db))
    }

    /// Create a repository with an in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let db = DatabaseConnection::new_in_memory()?;
        Ok(Self::new(db))
    }

    /// Underlying connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
    where
        T: std::str::FromStr<Err = anyhow::Error>,
    {
        value
            .parse()
            .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    }

    fn session_from_row(row: &Row) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            id: row.get(0)?,
            title: row.get(1)?,
            memo: row.get(2)?,
            custom_dictionary: row.get(3)?,
            original_filename: row.get(4)?,
            source_text: row.get(5)?,
            source_hash: row.get(6)?,
            translated_text: row.get(7)?,
            status: Self::parse_column(8, row.get(8)?)?,
            total_chunks: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn chunk_from_row(row: &Row) -> rusqlite::Result<ChunkRecord> {
        Ok(ChunkRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            order: row.get(2)?,
            source_text: row.get(3)?,
            translated_text: row.get(4)?,
            status: Self::parse_column(5, row.get(5)?)?,
            error_message: row.get(6)?,
            retry_count: row.get(7)?,
            token_count: row.get(8)?,
            duration_ms: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    /// Get a session by ID (synchronous version for use within transactions)
    fn get_session_sync(conn: &Connection, session_id: &str) -> Result<Option<SessionRecord>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        let session = conn
            .query_row(&sql, [session_id], Self::session_from_row)
            .optional()?;
        Ok(session)
    }

    /// Get a chunk by ID (synchronous version for use within transactions)
    fn get_chunk_sync(conn: &Connection, chunk_id: i64) -> Result<Option<ChunkRecord>> {
        let sql = format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS);
        let chunk = conn
            .query_row(&sql, [chunk_id], Self::chunk_from_row)
            .optional()?;
        Ok(chunk)
    }

    /// Load a session and check its status against `expected`
    fn guard_session(
        conn: &Connection,
        session_id: &str,
        expected: &[SessionStatus],
    ) -> Result<RepoResult<SessionRecord>> {
        let Some(session) = Self::get_session_sync(conn, session_id)? else {
            return Ok(Err(RepositoryError::session_not_found(session_id)));
        };
        if !expected.contains(&session.status) {
            return Ok(Err(RepositoryError::Conflict(format!(
                "session {} is {}, expected one of {:?}",
                session.short_id(),
                session.status,
                expected
            ))));
        }
        Ok(Ok(session))
    }

    /// Re-read a chunk after a conditional write matched no row
    fn chunk_write_miss(conn: &Connection, chunk_id: i64) -> Result<RepositoryError> {
        Ok(match Self::get_chunk_sync(conn, chunk_id)? {
            None => RepositoryError::chunk_not_found(chunk_id),
            Some(chunk) => RepositoryError::Conflict(format!(
                "chunk {} is {}, expected processing",
                chunk_id, chunk.status
            )),
        })
    }

    fn session_or_not_found(conn: &Connection, session_id: &str) -> Result<RepoResult<SessionRecord>> {
        Ok(Self::get_session_sync(conn, session_id)?
            .ok_or_else(|| RepositoryError::session_not_found(session_id)))
    }
}

#[async_trait]
impl SessionRepository for SqliteRepository {
    // =========================================================================
    // Session Operations
    // =========================================================================

    async fn create_session(&self, session: &SessionRecord) -> RepoResult<()> {
        let session = session.clone();

        self.db
            .execute_async(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sessions (
                        id, title, memo, custom_dictionary, original_filename, source_text,
                        source_hash, translated_text, status, total_chunks,
                        created_at, updated_at, completed_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    "#,
                    params![
                        session.id,
                        session.title,
                        session.memo,
                        session.custom_dictionary,
                        session.original_filename,
                        session.source_text,
                        session.source_hash,
                        session.translated_text,
                        session.status.to_string(),
                        session.total_chunks,
                        session.created_at,
                        session.updated_at,
                        session.completed_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> RepoResult<Option<SessionRecord>> {
        let session_id = session_id.to_string();

        let session = self
            .db
            .execute_async(move |conn| Self::get_session_sync(conn, &session_id))
            .await?;
        Ok(session)
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> RepoResult<Vec<SessionRecord>> {
        let sessions = self
            .db
            .execute_async(move |conn| {
                let sessions: Vec<SessionRecord> = if let Some(status) = status {
                    let sql = format!(
                        "SELECT {} FROM sessions WHERE status = ?1 ORDER BY updated_at DESC",
                        SESSION_COLUMNS
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    stmt.query_map([status.to_string()], Self::session_from_row)?
                        .collect::<rusqlite::Result<_>>()?
                } else {
                    let sql = format!("SELECT {} FROM sessions ORDER BY updated_at DESC", SESSION_COLUMNS);
                    let mut stmt = conn.prepare(&sql)?;
                    stmt.query_map([], Self::session_from_row)?
                        .collect::<rusqlite::Result<_>>()?
                };
                Ok(sessions)
            })
            .await?;
        Ok(sessions)
    }

    async fn find_session_by_source_hash(&self, source_hash: &str) -> RepoResult<Option<SessionRecord>> {
        let source_hash = source_hash.to_string();

        let session = self
            .db
            .execute_async(move |conn| {
                let sql = format!(
                    "SELECT {} FROM sessions WHERE source_hash = ?1 ORDER BY updated_at DESC LIMIT 1",
                    SESSION_COLUMNS
                );
                Ok(conn
                    .query_row(&sql, [source_hash], Self::session_from_row)
                    .optional()?)
            })
            .await?;
        Ok(session)
    }

    async fn update_session(&self, session_id: &str, update: &SessionUpdate) -> RepoResult<SessionRecord> {
        let session_id = session_id.to_string();
        let update = update.clone();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                let Some(mut session) = Self::get_session_sync(tx, &session_id)? else {
                    return Ok(Err(RepositoryError::session_not_found(session_id)));
                };
                if let Some(title) = update.title {
                    session.title = title;
                }
                if let Some(memo) = update.memo {
                    session.memo = memo;
                }
                if let Some(dictionary) = update.custom_dictionary {
                    session.custom_dictionary = dictionary;
                }
                tx.execute(
                    "UPDATE sessions SET title = ?1, memo = ?2, custom_dictionary = ?3, updated_at = ?4 WHERE id = ?5",
                    params![session.title, session.memo, session.custom_dictionary, now, session_id],
                )?;
                Self::session_or_not_found(tx, &session_id)
            })
            .await?
    }

    async fn transition_session(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> RepoResult<SessionRecord> {
        let session_id = session_id.to_string();
        let expected = expected.to_vec();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                if let Err(e) = Self::guard_session(tx, &session_id, &expected)? {
                    return Ok(Err(e));
                }
                if next == SessionStatus::Completed {
                    tx.execute(
                        "UPDATE sessions SET status = ?1, updated_at = ?2, completed_at = ?2 WHERE id = ?3",
                        params![next.to_string(), now, session_id],
                    )?;
                } else {
                    tx.execute(
                        r#"
                        UPDATE sessions
                        SET status = ?1, updated_at = ?2, translated_text = NULL, completed_at = NULL
                        WHERE id = ?3
                        "#,
                        params![next.to_string(), now, session_id],
                    )?;
                }
                debug!("Session {} -> {}", session_id, next);
                Self::session_or_not_found(tx, &session_id)
            })
            .await?
    }

    async fn complete_session(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        translated_text: &str,
    ) -> RepoResult<SessionRecord> {
        let session_id = session_id.to_string();
        let expected = expected.to_vec();
        let translated_text = translated_text.to_string();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                if let Err(e) = Self::guard_session(tx, &session_id, &expected)? {
                    return Ok(Err(e));
                }
                tx.execute(
                    r#"
                    UPDATE sessions
                    SET status = 'completed', translated_text = ?1, updated_at = ?2, completed_at = ?2
                    WHERE id = ?3
                    "#,
                    params![translated_text, now, session_id],
                )?;
                Self::session_or_not_found(tx, &session_id)
            })
            .await?
    }

    async fn replace_chunks(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        source: &SourceAttachment,
        chunks: Vec<NewChunk>,
    ) -> RepoResult<SessionRecord> {
        let session_id = session_id.to_string();
        let expected = expected.to_vec();
        let source = source.clone();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                if let Err(e) = Self::guard_session(tx, &session_id, &expected)? {
                    return Ok(Err(e));
                }
                tx.execute("DELETE FROM chunks WHERE session_id = ?1", [&session_id])?;
                {
                    let mut insert = tx.prepare(
                        r#"
                        INSERT INTO chunks (session_id, chunk_order, source_text, status, retry_count, created_at, updated_at)
                        VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
                        "#,
                    )?;
                    for chunk in &chunks {
                        insert.execute(params![session_id, chunk.order, chunk.source_text, now])?;
                    }
                }
                tx.execute(
                    r#"
                    UPDATE sessions
                    SET source_text = ?1, source_hash = ?2, original_filename = ?3, total_chunks = ?4,
                        status = 'ready', translated_text = NULL, completed_at = NULL, updated_at = ?5
                    WHERE id = ?6
                    "#,
                    params![
                        source.text,
                        source.hash,
                        source.original_filename,
                        chunks.len() as i64,
                        now,
                        session_id
                    ],
                )?;
                Self::session_or_not_found(tx, &session_id)
            })
            .await?
    }

    async fn delete_session(&self, session_id: &str) -> RepoResult<bool> {
        let session_id = session_id.to_string();

        let deleted = self
            .db
            .execute_async(move |conn| {
                // Due to CASCADE, deleting the session will delete its chunks
                let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [&session_id])?;
                Ok(deleted > 0)
            })
            .await?;
        Ok(deleted)
    }

    // =========================================================================
    // Chunk Operations
    // =========================================================================

    async fn list_chunks(&self, session_id: &str) -> RepoResult<Vec<ChunkRecord>> {
        let session_id = session_id.to_string();

        let chunks = self
            .db
            .execute_async(move |conn| {
                let sql = format!(
                    "SELECT {} FROM chunks WHERE session_id = ?1 ORDER BY chunk_order",
                    CHUNK_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let chunks = stmt
                    .query_map([&session_id], Self::chunk_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(chunks)
            })
            .await?;
        Ok(chunks)
    }

    async fn list_chunks_page(
        &self,
        session_id: &str,
        page: usize,
        page_size: usize,
        status: Option<ChunkStatus>,
    ) -> RepoResult<ChunkPage> {
        let session_id = session_id.to_string();
        let status = status.map(|s| s.to_string());
        let offset = (page * page_size) as i64;

        let page = self
            .db
            .execute_async(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE session_id = ?1 AND (?2 IS NULL OR status = ?2)",
                    params![session_id, status],
                    |row| row.get(0),
                )?;
                let sql = format!(
                    r#"
                    SELECT {} FROM chunks
                    WHERE session_id = ?1 AND (?2 IS NULL OR status = ?2)
                    ORDER BY chunk_order
                    LIMIT ?3 OFFSET ?4
                    "#,
                    CHUNK_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let items = stmt
                    .query_map(
                        params![session_id, status, page_size as i64, offset],
                        Self::chunk_from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ChunkPage {
                    items,
                    page,
                    page_size,
                    total: total as usize,
                })
            })
            .await?;
        Ok(page)
    }

    async fn get_chunk(&self, chunk_id: i64) -> RepoResult<Option<ChunkRecord>> {
        let chunk = self
            .db
            .execute_async(move |conn| Self::get_chunk_sync(conn, chunk_id))
            .await?;
        Ok(chunk)
    }

    async fn claim_chunk(
        &self,
        chunk_id: i64,
        expected: &[ChunkStatus],
        session_states: &[SessionStatus],
        bump_retry: bool,
    ) -> RepoResult<ChunkRecord> {
        let expected = expected.to_vec();
        let session_states = session_states.to_vec();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                let Some(chunk) = Self::get_chunk_sync(tx, chunk_id)? else {
                    return Ok(Err(RepositoryError::chunk_not_found(chunk_id)));
                };
                if let Err(e) = Self::guard_session(tx, &chunk.session_id, &session_states)? {
                    return Ok(Err(e));
                }
                if !expected.contains(&chunk.status) {
                    return Ok(Err(RepositoryError::Conflict(format!(
                        "chunk {} (order {}) is {}",
                        chunk_id, chunk.order, chunk.status
                    ))));
                }
                tx.execute(
                    r#"
                    UPDATE chunks
                    SET status = 'processing', translated_text = NULL, error_message = NULL,
                        retry_count = retry_count + ?1, updated_at = ?2
                    WHERE id = ?3 AND status = ?4
                    "#,
                    params![bump_retry as i64, now, chunk_id, chunk.status.to_string()],
                )?;
                Ok(Self::get_chunk_sync(tx, chunk_id)?
                    .ok_or_else(|| RepositoryError::chunk_not_found(chunk_id)))
            })
            .await?
    }

    async fn complete_chunk(
        &self,
        chunk_id: i64,
        translated_text: &str,
        token_count: Option<i64>,
        duration_ms: i64,
    ) -> RepoResult<ChunkRecord> {
        let translated_text = translated_text.to_string();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                let updated = tx.execute(
                    r#"
                    UPDATE chunks
                    SET status = 'completed', translated_text = ?1, token_count = ?2, duration_ms = ?3,
                        error_message = NULL, updated_at = ?4
                    WHERE id = ?5 AND status = 'processing'
                    "#,
                    params![translated_text, token_count, duration_ms, now, chunk_id],
                )?;
                if updated == 0 {
                    return Ok(Err(Self::chunk_write_miss(tx, chunk_id)?));
                }
                Ok(Self::get_chunk_sync(tx, chunk_id)?
                    .ok_or_else(|| RepositoryError::chunk_not_found(chunk_id)))
            })
            .await?
    }

    async fn fail_chunk(
        &self,
        chunk_id: i64,
        error_message: &str,
        duration_ms: i64,
    ) -> RepoResult<ChunkRecord> {
        let error_message = error_message.to_string();
        let now = Self::now();

        self.db
            .transaction_async(move |tx| {
                let updated = tx.execute(
                    r#"
                    UPDATE chunks
                    SET status = 'failed', translated_text = NULL, error_message = ?1, duration_ms = ?2,
                        updated_at = ?3
                    WHERE id = ?4 AND status = 'processing'
                    "#,
                    params![error_message, duration_ms, now, chunk_id],
                )?;
                if updated == 0 {
                    return Ok(Err(Self::chunk_write_miss(tx, chunk_id)?));
                }
                Ok(Self::get_chunk_sync(tx, chunk_id)?
                    .ok_or_else(|| RepositoryError::chunk_not_found(chunk_id)))
            })
            .await?
    }

    async fn requeue_failed_chunks(&self, session_id: &str) -> RepoResult<usize> {
        let session_id = session_id.to_string();
        let now = Self::now();

        let count = self
            .db
            .execute_async(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE chunks
                    SET status = 'pending', error_message = NULL, retry_count = retry_count + 1, updated_at = ?1
                    WHERE session_id = ?2 AND status = 'failed'
                    "#,
                    params![now, session_id],
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    async fn reset_chunks(&self, session_id: &str) -> RepoResult<usize> {
        let session_id = session_id.to_string();
        let now = Self::now();

        let count = self
            .db
            .execute_async(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE chunks
                    SET status = 'pending', translated_text = NULL, error_message = NULL, retry_count = 0,
                        token_count = NULL, duration_ms = NULL, updated_at = ?1
                    WHERE session_id = ?2
                    "#,
                    params![now, session_id],
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }

    async fn recover_interrupted(&self) -> RepoResult<RecoveryReport> {
        let now = Self::now();

        let report = self
            .db
            .transaction_async(move |tx| {
                let chunks_requeued = tx.execute(
                    "UPDATE chunks SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
                    [&now],
                )?;
                let sessions_paused = tx.execute(
                    "UPDATE sessions SET status = 'paused', updated_at = ?1 WHERE status = 'translating'",
                    [&now],
                )?;
                Ok(RecoveryReport { sessions_paused, chunks_requeued })
            })
            .await?;
        Ok(report)
    }
}
