/*!
 * Command surface of the translation engine.
 *
 * The `Orchestrator` is the only component that initiates session and
 * chunk transitions. Commands validate against the lifecycle guards,
 * persist through the repository and publish the matching events; bulk
 * runs are handed to the scheduler in `run`.
 */

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;

use crate::app_config::EngineConfig;
use crate::database::hash_text;
use crate::database::models::{
    ChunkPage, ChunkRecord, ChunkStatus, NewChunk, RecoveryReport, SessionRecord, SessionStatus,
    SessionUpdate, SourceAttachment,
};
use crate::database::SessionRepository;
use crate::errors::{EngineError, EngineResult};
use crate::providers::Provider;
use crate::session::{SessionCreateParams, SourceInput};
use crate::translation::dictionary::CustomDictionary;
use crate::translation::events::{EventBus, Subscription, TranslationEvent};
use crate::translation::guards::{self, MANUAL_CLAIMABLE, MANUAL_SESSION_STATES};
use crate::translation::progress::Progress;
use crate::translation::prompts::TemplateContext;
use crate::translation::run::{state_error, Engine};
use crate::translation::splitter::split_text;
use crate::translation::tokens::TokenCounter;

/// Drives sessions through their lifecycle
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.engine.provider.name())
            .field("settings", &self.engine.settings)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator with its own event bus
    pub fn new(repo: Arc<dyn SessionRepository>, provider: Arc<dyn Provider>, settings: EngineConfig) -> Self {
        Self::with_bus(repo, provider, settings, EventBus::new())
    }

    /// Create an orchestrator publishing on an existing bus
    pub fn with_bus(
        repo: Arc<dyn SessionRepository>,
        provider: Arc<dyn Provider>,
        settings: EngineConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(repo, provider, bus, settings)),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.engine.bus
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.engine.settings
    }

    /// Install the local counter used for chunks whose provider reports no
    /// token usage. Can be set once.
    pub fn set_token_counter(&self, counter: TokenCounter) -> EngineResult<()> {
        let source = counter.source().to_path_buf();
        self.engine
            .token_counter
            .set(counter)
            .map_err(|_| EngineError::InvalidState("token counter already set".to_string()))?;
        info!("Counting tokens locally with {:?}", source);
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create a draft session
    pub async fn create_session(&self, params: SessionCreateParams) -> EngineResult<SessionRecord> {
        let title = params.title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("session title is empty".to_string()));
        }

        let mut session = SessionRecord::new(uuid::Uuid::new_v4().to_string(), title.to_string());
        session.memo = params.memo;
        session.custom_dictionary = params.custom_dictionary;

        self.engine.repo.create_session(&session).await?;
        info!("Created session {} ({})", session.id, session.title);
        Ok(session)
    }

    /// Edit title, memo or dictionary
    pub async fn update_session(&self, session_id: &str, update: SessionUpdate) -> EngineResult<SessionRecord> {
        if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(EngineError::Validation("session title is empty".to_string()));
        }
        let update = SessionUpdate {
            title: update.title.map(|t| t.trim().to_string()),
            ..update
        };
        Ok(self.engine.repo.update_session(session_id, &update).await?)
    }

    /// Delete a session and its chunks. Returns `false` when it did not
    /// exist.
    pub async fn delete_session(&self, session_id: &str) -> EngineResult<bool> {
        self.engine.signal_pause(session_id);
        let deleted = self.engine.repo.delete_session(session_id).await?;
        if deleted {
            info!("Deleted session {}", session_id);
        }
        Ok(deleted)
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<SessionRecord> {
        self.engine.require_session(session_id).await
    }

    /// Sessions, most recently updated first
    pub async fn list_sessions(&self, status: Option<SessionStatus>) -> EngineResult<Vec<SessionRecord>> {
        Ok(self.engine.repo.list_sessions(status).await?)
    }

    /// Most recent session built from the same source text
    pub async fn find_session_by_source(&self, text: &str) -> EngineResult<Option<SessionRecord>> {
        Ok(self.engine.repo.find_session_by_source_hash(&hash_text(text)).await?)
    }

    /// Attach source text, split it and make the session `ready`
    pub async fn ingest_source(&self, session_id: &str, input: SourceInput) -> EngineResult<SessionRecord> {
        let session = self.engine.require_session(session_id).await?;
        guards::ensure_session_status(
            session.status,
            &[SessionStatus::Draft, SessionStatus::Ready],
            "ingest source into",
        )?;

        let (text, original_filename) = input.decode()?;
        let chunks: Vec<NewChunk> = split_text(&text, self.engine.settings.chunk_size)?
            .into_iter()
            .enumerate()
            .map(|(order, source)| NewChunk::new(order as i64, source))
            .collect();
        let chunk_count = chunks.len();

        let source = SourceAttachment {
            hash: hash_text(&text),
            text,
            original_filename,
        };
        let session = self
            .engine
            .repo
            .replace_chunks(session_id, &[SessionStatus::Draft, SessionStatus::Ready], &source, chunks)
            .await
            .map_err(state_error)?;

        info!("Session {} ingested {} chunk(s)", session_id, chunk_count);
        self.engine.publish_status(&session, self.engine.progress_of(session_id).await?);
        Ok(session)
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Start a bulk run over a `ready` session
    pub async fn start_run(&self, session_id: &str, ctx: TemplateContext) -> EngineResult<SessionRecord> {
        ctx.validate()?;
        let session = self.engine.require_session(session_id).await?;
        guards::ensure_session_status(session.status, &[SessionStatus::Ready], "start")?;
        if session.total_chunks == 0 {
            return Err(EngineError::InvalidState(format!("session {} has no chunks", session_id)));
        }
        if self.engine.has_active_run(session_id) {
            return Err(EngineError::InvalidState(format!("session {} already has an active run", session_id)));
        }

        self.begin_run(session_id, &[SessionStatus::Ready], ctx).await
    }

    /// Stop claiming new chunks. In-flight calls finish and are recorded.
    pub async fn pause_run(&self, session_id: &str) -> EngineResult<SessionRecord> {
        let session = self.engine.require_session(session_id).await?;
        match session.status {
            SessionStatus::Paused => return Ok(session),
            SessionStatus::Translating => {}
            other => {
                return Err(EngineError::InvalidState(format!(
                    "cannot pause a session that is {}",
                    other
                )))
            }
        }

        let session = self
            .engine
            .repo
            .transition_session(session_id, &[SessionStatus::Translating], SessionStatus::Paused)
            .await
            .map_err(state_error)?;
        self.engine.signal_pause(session_id);

        info!("Paused session {}", session_id);
        self.engine.publish_status(&session, self.engine.progress_of(session_id).await?);
        Ok(session)
    }

    /// Continue a paused session from its first pending chunk
    pub async fn resume_run(&self, session_id: &str, ctx: TemplateContext) -> EngineResult<SessionRecord> {
        ctx.validate()?;
        let session = self.engine.require_session(session_id).await?;
        guards::ensure_session_status(session.status, &[SessionStatus::Paused], "resume")?;

        // The previous run may still be finishing its in-flight chunks
        self.engine.wait_for_drain(session_id).await;
        self.begin_run(session_id, &[SessionStatus::Paused], ctx).await
    }

    /// Requeue every failed chunk and start a bulk run over them
    pub async fn retry_failed_chunks(&self, session_id: &str, ctx: TemplateContext) -> EngineResult<SessionRecord> {
        ctx.validate()?;
        let (session, chunks) = self.engine.load(session_id).await?;
        let allowed = guards::sources_of(SessionStatus::Translating);
        guards::ensure_session_status(session.status, &allowed, "retry failed chunks of")?;
        if !chunks.iter().any(|c| c.status == ChunkStatus::Failed) {
            return Err(EngineError::InvalidState(format!(
                "session {} has no failed chunks",
                session_id
            )));
        }

        self.engine.wait_for_drain(session_id).await;
        let requeued = self.engine.repo.requeue_failed_chunks(session_id).await?;
        info!("Requeued {} failed chunk(s) of session {}", requeued, session_id);

        self.begin_run(session_id, &allowed, ctx).await
    }

    /// Wait for the active run of a session, if any, and return the session
    pub async fn wait_for_run(&self, session_id: &str) -> EngineResult<SessionRecord> {
        self.engine.wait_for_drain(session_id).await;
        self.engine.require_session(session_id).await
    }

    pub fn has_active_run(&self, session_id: &str) -> bool {
        self.engine.has_active_run(session_id)
    }

    async fn begin_run(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        ctx: TemplateContext,
    ) -> EngineResult<SessionRecord> {
        let slot = self.engine.register(session_id)?;
        let session = match self
            .engine
            .repo
            .transition_session(session_id, expected, SessionStatus::Translating)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.engine.abandon(session_id, slot);
                return Err(state_error(e));
            }
        };

        info!("Session {} translating ({} chunks)", session_id, session.total_chunks);
        match self.engine.progress_of(session_id).await {
            Ok(progress) => self.engine.publish_status(&session, progress),
            Err(e) => debug!("No progress for session {}: {}", session_id, e),
        }
        self.engine.launch(session_id, slot, ctx);
        Ok(session)
    }

    // =========================================================================
    // Manual chunk operations
    // =========================================================================

    /// Retry a failed chunk on its own
    pub async fn retry_chunk(&self, chunk_id: i64, ctx: TemplateContext) -> EngineResult<ChunkRecord> {
        self.run_manual(chunk_id, ctx, &[ChunkStatus::Failed]).await
    }

    /// Translate a pending chunk, retry a failed one or retranslate a
    /// completed one
    pub async fn translate_chunk(&self, chunk_id: i64, ctx: TemplateContext) -> EngineResult<ChunkRecord> {
        self.run_manual(chunk_id, ctx, &MANUAL_CLAIMABLE).await
    }

    async fn run_manual(&self, chunk_id: i64, ctx: TemplateContext, allowed: &[ChunkStatus]) -> EngineResult<ChunkRecord> {
        ctx.validate()?;
        let chunk = self
            .engine
            .repo
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("chunk not found: {}", chunk_id)))?;
        let session = self.engine.require_session(&chunk.session_id).await?;
        guards::ensure_session_status(session.status, &MANUAL_SESSION_STATES, "translate chunks of")?;
        guards::ensure_chunk_claimable(chunk.status, allowed)?;

        if session.status.is_terminal() {
            guards::ensure_transition(session.status, SessionStatus::Paused)?;
            let paused = self
                .engine
                .repo
                .transition_session(&session.id, &[session.status], SessionStatus::Paused)
                .await
                .map_err(state_error)?;
            debug!("Session {} reopened for chunk {}", session.id, chunk.order);
            self.engine.publish_status(&paused, self.engine.progress_of(&session.id).await?);
        }

        let claimed = self
            .engine
            .repo
            .claim_chunk(
                chunk_id,
                allowed,
                &MANUAL_SESSION_STATES,
                chunk.status == ChunkStatus::Failed,
            )
            .await?;
        let dictionary = CustomDictionary::from_session(session.custom_dictionary.as_deref());
        self.engine.execute(claimed, &ctx, &dictionary).await;

        self.engine.settle(&session.id, None).await?;
        self.engine
            .repo
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("chunk not found: {}", chunk_id)))
    }

    /// Put every chunk back to a fresh pending state and the session to
    /// `ready`
    pub async fn reset_session(&self, session_id: &str) -> EngineResult<SessionRecord> {
        let (session, chunks) = self.engine.load(session_id).await?;
        if self.engine.has_active_run(session_id) {
            return Err(EngineError::InvalidState(format!(
                "session {} has an active run",
                session_id
            )));
        }
        let allowed = [
            SessionStatus::Ready,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ];
        guards::ensure_session_status(session.status, &allowed, "reset")?;
        if chunks.iter().any(|c| c.status == ChunkStatus::Processing) {
            return Err(EngineError::Conflict(format!(
                "session {} has a chunk being translated",
                session_id
            )));
        }

        let reset = self.engine.repo.reset_chunks(session_id).await?;
        let session = self
            .engine
            .repo
            .transition_session(session_id, &allowed, SessionStatus::Ready)
            .await
            .map_err(state_error)?;

        info!("Reset {} chunk(s) of session {}", reset, session_id);
        self.engine.publish_status(&session, self.engine.progress_of(session_id).await?);
        Ok(session)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Progress derived from the current chunk states
    pub async fn get_progress(&self, session_id: &str) -> EngineResult<Progress> {
        self.engine.require_session(session_id).await?;
        self.engine.progress_of(session_id).await
    }

    /// Completed chunk translations in order, whether or not the session is
    /// complete
    pub async fn get_partial_translation(&self, session_id: &str) -> EngineResult<String> {
        let (_, chunks) = self.engine.load(session_id).await?;
        Ok(chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .filter_map(|c| c.translated_text.as_deref())
            .collect())
    }

    /// One zero-based page of chunks
    pub async fn list_chunks(
        &self,
        session_id: &str,
        page: usize,
        status: Option<ChunkStatus>,
    ) -> EngineResult<ChunkPage> {
        self.engine.require_session(session_id).await?;
        Ok(self
            .engine
            .repo
            .list_chunks_page(session_id, page, self.engine.settings.page_size, status)
            .await?)
    }

    // =========================================================================
    // Events and recovery
    // =========================================================================

    pub fn subscribe<F>(&self, session_id: &str, handler: F) -> Subscription
    where
        F: Fn(&TranslationEvent) + Send + Sync + 'static,
    {
        self.engine.bus.subscribe(session_id, handler)
    }

    pub fn subscribe_channel(&self, session_id: &str) -> (Subscription, mpsc::UnboundedReceiver<TranslationEvent>) {
        self.engine.bus.subscribe_channel(session_id)
    }

    /// Requeue work left `processing` by a previous process and pause the
    /// sessions it belonged to
    pub async fn recover_interrupted(&self) -> EngineResult<RecoveryReport> {
        let report = self.engine.repo.recover_interrupted().await?;
        if report.sessions_paused > 0 || report.chunks_requeued > 0 {
            info!(
                "Recovered {} interrupted session(s), {} chunk(s) requeued",
                report.sessions_paused, report.chunks_requeued
            );
        }
        Ok(report)
    }
}
