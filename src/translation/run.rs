/*!
 * Bulk run scheduling and per-chunk execution.
 *
 * A run walks the pending chunks of one session in order. Each chunk is
 * claimed in the repository before a worker slot is handed to it, so a
 * manual operation racing the run can never submit the same chunk twice.
 * Pausing is cooperative: the run stops claiming, in-flight calls finish
 * and are recorded. A claim only succeeds while the session is still
 * `translating`, so nothing new starts once a pause is stored.
 *
 * When the run drains, the session is settled: completed if every chunk
 * is, otherwise the failure policy decides between paused and failed.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::app_config::EngineConfig;
use crate::database::models::{ChunkRecord, ChunkStatus, SessionRecord, SessionStatus};
use crate::database::SessionRepository;
use crate::errors::{EngineError, EngineResult, RepositoryError};
use crate::providers::Provider;
use crate::translation::dictionary::CustomDictionary;
use crate::translation::events::{EventBus, TranslationEvent};
use crate::translation::progress::Progress;
use crate::translation::prompts::TemplateContext;
use crate::translation::tokens::TokenCounter;
use crate::translation::FailurePolicy;

/// Pause signal shared between a run and the commands that control it
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    paused: AtomicBool,
}

impl RunControl {
    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Registry entry of a run in progress
struct ActiveRun {
    run_id: u64,
    control: Arc<RunControl>,
    done: watch::Receiver<bool>,
}

/// A run that holds its registry slot but has not been spawned yet
pub(crate) struct RunSlot {
    run_id: u64,
    control: Arc<RunControl>,
    done: watch::Sender<bool>,
}

/// Counters of one bulk run
#[derive(Debug, Default)]
pub(crate) struct RunStats {
    claimed: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl RunStats {
    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} claimed, {} completed, {} failed, {} skipped",
            self.claimed.load(Ordering::SeqCst),
            self.completed.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
            self.skipped.load(Ordering::SeqCst)
        )
    }
}

/// Result of one provider call on a claimed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    Completed,
    Failed,
    /// The chunk or its session disappeared, or storage failed
    Lost,
}

/// What settling a quiescent session does to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Complete,
    Pause,
    Fail,
}

/// Decide how to settle a session no run is scheduling anymore.
///
/// `run_completed` is the number of chunks the drained run completed, or
/// `None` when settling after a manual operation.
pub(crate) fn decide_settlement(
    status: SessionStatus,
    progress: &Progress,
    processing: usize,
    policy: FailurePolicy,
    run_completed: Option<usize>,
) -> Option<Settlement> {
    if progress.is_complete() {
        return matches!(
            status,
            SessionStatus::Ready | SessionStatus::Translating | SessionStatus::Paused
        )
        .then_some(Settlement::Complete);
    }
    if status != SessionStatus::Translating || processing > 0 || progress.total == 0 {
        return None;
    }
    if progress.pending > 0 || progress.failed == 0 {
        // Stopped early with work left
        return Some(Settlement::Pause);
    }
    match (policy, run_completed) {
        (FailurePolicy::FailWhenStalled, Some(0)) => Some(Settlement::Fail),
        _ => Some(Settlement::Pause),
    }
}

/// Map a conditional status update that lost a race to `InvalidState`
pub(crate) fn state_error(error: RepositoryError) -> EngineError {
    match error {
        RepositoryError::Conflict(message) => EngineError::InvalidState(message),
        other => other.into(),
    }
}

/// Shared state behind an `Orchestrator`
pub(crate) struct Engine {
    pub(crate) repo: Arc<dyn SessionRepository>,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) bus: EventBus,
    pub(crate) settings: EngineConfig,
    /// Counts tokens when the provider reports no usage
    pub(crate) token_counter: OnceCell<TokenCounter>,
    runs: Mutex<HashMap<String, ActiveRun>>,
    next_run_id: AtomicU64,
}

impl Engine {
    pub(crate) fn new(
        repo: Arc<dyn SessionRepository>,
        provider: Arc<dyn Provider>,
        bus: EventBus,
        settings: EngineConfig,
    ) -> Self {
        Self {
            repo,
            provider,
            bus,
            settings,
            token_counter: OnceCell::new(),
            runs: Mutex::new(HashMap::new()),
            next_run_id: AtomicU64::new(1),
        }
    }

    // =========================================================================
    // Run registry
    // =========================================================================

    pub(crate) fn has_active_run(&self, session_id: &str) -> bool {
        self.runs.lock().contains_key(session_id)
    }

    /// Ask the active run of a session, if any, to stop claiming chunks
    pub(crate) fn signal_pause(&self, session_id: &str) {
        if let Some(run) = self.runs.lock().get(session_id) {
            run.control.pause();
        }
    }

    /// Wait until the run currently registered for the session has settled
    pub(crate) async fn wait_for_drain(&self, session_id: &str) {
        let done = self.runs.lock().get(session_id).map(|run| run.done.clone());
        if let Some(mut done) = done {
            // A dropped sender means the run task is gone as well
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    fn finish_run(&self, session_id: &str, run_id: u64) {
        let mut runs = self.runs.lock();
        if runs.get(session_id).is_some_and(|run| run.run_id == run_id) {
            runs.remove(session_id);
        }
    }

    /// Reserve the registry slot of a session before it moves to
    /// `translating`, so a pause landing right after the transition always
    /// finds the run's control
    pub(crate) fn register(&self, session_id: &str) -> EngineResult<RunSlot> {
        let mut runs = self.runs.lock();
        if runs.contains_key(session_id) {
            return Err(EngineError::InvalidState(format!(
                "session {} already has an active run",
                session_id
            )));
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let control = Arc::new(RunControl::default());
        let (done_tx, done_rx) = watch::channel(false);
        runs.insert(
            session_id.to_string(),
            ActiveRun {
                run_id,
                control: Arc::clone(&control),
                done: done_rx,
            },
        );
        Ok(RunSlot {
            run_id,
            control,
            done: done_tx,
        })
    }

    /// Release a slot whose session never reached `translating`. Dropping
    /// the sender wakes anyone waiting on it.
    pub(crate) fn abandon(&self, session_id: &str, slot: RunSlot) {
        self.finish_run(session_id, slot.run_id);
    }

    /// Spawn the bulk run of a registered slot
    pub(crate) fn launch(self: &Arc<Self>, session_id: &str, slot: RunSlot, ctx: TemplateContext) {
        let RunSlot {
            run_id,
            control,
            done: done_tx,
        } = slot;
        let lease = self.bus.attach_run(session_id);

        let engine = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let _lease = lease;
            let stats = engine.drive(&session_id, &ctx, &control).await;
            info!("Run {} of session {} drained: {}", run_id, session_id, stats);

            engine.finish_run(&session_id, run_id);
            if let Err(e) = engine.settle(&session_id, Some(stats.completed())).await {
                match e {
                    EngineError::NotFound(_) => debug!("Session {} vanished before settling", session_id),
                    other => error!("Failed to settle session {}: {}", session_id, other),
                }
            }
            let _ = done_tx.send(true);
        });
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Claim and execute pending chunks in order until none is left, the
    /// run is paused or storage fails
    async fn drive(self: &Arc<Self>, session_id: &str, ctx: &TemplateContext, control: &RunControl) -> Arc<RunStats> {
        let stats = Arc::new(RunStats::default());

        let (session, chunks) = match self.load(session_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Run for session {} could not load its chunks: {}", session_id, e);
                return stats;
            }
        };
        let dictionary = Arc::new(CustomDictionary::from_session(session.custom_dictionary.as_deref()));
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrent_requests.max(1)));
        let mut workers = JoinSet::new();

        for chunk in chunks.into_iter().filter(|c| c.status == ChunkStatus::Pending) {
            if control.is_paused() {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if control.is_paused() {
                break;
            }

            let claimed = match self
                .repo
                .claim_chunk(chunk.id, &[ChunkStatus::Pending], &[SessionStatus::Translating], false)
                .await
            {
                Ok(claimed) => claimed,
                Err(RepositoryError::Conflict(reason)) => {
                    if !self.is_translating(session_id).await {
                        debug!("Session {} left translating, stopping run", session_id);
                        break;
                    }
                    debug!("Skipping chunk {} of session {}: {}", chunk.order, session_id, reason);
                    stats.skipped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                Err(RepositoryError::NotFound { .. }) => {
                    debug!("Chunk {} of session {} is gone, stopping run", chunk.order, session_id);
                    break;
                }
                Err(e) => {
                    error!("Failed to claim chunk {} of session {}: {}", chunk.order, session_id, e);
                    break;
                }
            };
            stats.claimed.fetch_add(1, Ordering::SeqCst);

            let engine = Arc::clone(self);
            let ctx = ctx.clone();
            let dictionary = Arc::clone(&dictionary);
            let stats = Arc::clone(&stats);
            workers.spawn(async move {
                let _permit = permit;
                match engine.execute(claimed, &ctx, &dictionary).await {
                    ChunkOutcome::Completed => stats.completed.fetch_add(1, Ordering::SeqCst),
                    ChunkOutcome::Failed => stats.failed.fetch_add(1, Ordering::SeqCst),
                    ChunkOutcome::Lost => 0,
                };
            });

            // Reap finished workers so the set does not grow with the session
            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!("Chunk worker of session {} panicked: {}", session_id, e);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Chunk worker of session {} panicked: {}", session_id, e);
            }
        }

        stats
    }

    /// Translate one claimed chunk and record the outcome
    pub(crate) async fn execute(
        &self,
        chunk: ChunkRecord,
        ctx: &TemplateContext,
        dictionary: &CustomDictionary,
    ) -> ChunkOutcome {
        let session_id = chunk.session_id.clone();
        self.bus.publish(
            &session_id,
            &TranslationEvent::ChunkStart {
                session_id: session_id.clone(),
                chunk_id: chunk.id,
                order: chunk.order,
            },
        );

        let reference = format!("{}:{}", session_id, chunk.order);
        let prompt = ctx.render(&chunk.source_text, dictionary, Some(reference));
        let rendered = self
            .token_counter
            .get()
            .map(|_| format!("{}\n{}", prompt.system_prompt, prompt.user_prompt));

        let started = Instant::now();
        let result = self.provider.generate(prompt).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let recorded = match result {
            Ok(generation) if generation.text.trim().is_empty() && !chunk.source_text.trim().is_empty() => {
                warn!("Chunk {} of session {} came back empty", chunk.order, session_id);
                self.repo
                    .fail_chunk(chunk.id, "provider returned an empty translation", duration_ms)
                    .await
            }
            Ok(generation) => {
                debug!(
                    "Chunk {} of session {} translated in {} ms",
                    chunk.order, session_id, duration_ms
                );
                let tokens = match generation.token_usage {
                    Some(usage) => Some(usage.total() as i64),
                    None => self.count_tokens(rendered.as_deref(), &generation.text),
                };
                self.repo
                    .complete_chunk(chunk.id, &generation.text, tokens, duration_ms)
                    .await
            }
            Err(e) => {
                warn!(
                    "Chunk {} of session {} failed ({}): {}",
                    chunk.order,
                    session_id,
                    e.code(),
                    e
                );
                self.repo.fail_chunk(chunk.id, &e.to_string(), duration_ms).await
            }
        };

        let chunk = match recorded {
            Ok(chunk) => chunk,
            Err(RepositoryError::NotFound { .. }) => {
                debug!("Chunk {} of session {} was deleted mid-call", chunk.order, session_id);
                return ChunkOutcome::Lost;
            }
            Err(e) => {
                error!("Failed to record chunk {} of session {}: {}", chunk.order, session_id, e);
                return ChunkOutcome::Lost;
            }
        };

        let outcome = match chunk.status {
            ChunkStatus::Completed => ChunkOutcome::Completed,
            _ => ChunkOutcome::Failed,
        };

        match self.progress_of(&session_id).await {
            Ok(progress) => self.bus.publish(
                &session_id,
                &TranslationEvent::ChunkProgress {
                    session_id: session_id.clone(),
                    chunk,
                    progress,
                },
            ),
            Err(e) => debug!("No progress for session {}: {}", session_id, e),
        }

        outcome
    }

    // =========================================================================
    // Settling
    // =========================================================================

    /// Apply the completion rule and failure policy to a session that no run
    /// is scheduling. Runs after a bulk run drains and after manual chunk
    /// operations.
    pub(crate) async fn settle(&self, session_id: &str, run_completed: Option<usize>) -> EngineResult<SessionRecord> {
        let (session, chunks) = self.load(session_id).await?;
        if self.has_active_run(session_id) {
            return Ok(session);
        }

        let progress = Progress::from_chunks(&chunks);
        let processing = chunks.iter().filter(|c| c.status == ChunkStatus::Processing).count();
        let decision = decide_settlement(
            session.status,
            &progress,
            processing,
            self.settings.failure_policy,
            run_completed,
        );

        let settled = match decision {
            None => return Ok(session),
            Some(Settlement::Complete) => {
                let translated: String = chunks
                    .iter()
                    .filter_map(|c| c.translated_text.as_deref())
                    .collect();
                let settled = self
                    .repo
                    .complete_session(
                        session_id,
                        &[SessionStatus::Ready, SessionStatus::Translating, SessionStatus::Paused],
                        &translated,
                    )
                    .await
                    .map_err(state_error)?;
                info!("Session {} completed ({} chunks)", session_id, progress.total);
                self.publish_status(&settled, progress);
                self.bus.publish(
                    session_id,
                    &TranslationEvent::SessionComplete {
                        session_id: session_id.to_string(),
                        translated_text: translated,
                        progress,
                    },
                );
                return Ok(settled);
            }
            Some(Settlement::Pause) => SessionStatus::Paused,
            Some(Settlement::Fail) => SessionStatus::Failed,
        };

        let session = self
            .repo
            .transition_session(session_id, &[SessionStatus::Translating], settled)
            .await
            .map_err(state_error)?;
        if settled == SessionStatus::Failed {
            warn!("Session {} failed: the run could not translate any chunk", session_id);
        } else {
            info!("Session {} paused with {} failed chunk(s)", session_id, progress.failed);
        }
        self.publish_status(&session, progress);
        Ok(session)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) async fn load(&self, session_id: &str) -> EngineResult<(SessionRecord, Vec<ChunkRecord>)> {
        let session = self.require_session(session_id).await?;
        let chunks = self.repo.list_chunks(session_id).await?;
        Ok((session, chunks))
    }

    pub(crate) async fn require_session(&self, session_id: &str) -> EngineResult<SessionRecord> {
        self.repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session not found: {}", session_id)))
    }

    /// Local count over prompt and output, when a counter is configured
    fn count_tokens(&self, prompt: Option<&str>, output: &str) -> Option<i64> {
        let counter = self.token_counter.get()?;
        let counted = counter
            .count(prompt.unwrap_or_default())
            .and_then(|prompt_tokens| counter.count(output).map(|output_tokens| prompt_tokens + output_tokens));
        match counted {
            Ok(tokens) => Some(tokens as i64),
            Err(e) => {
                warn!("Could not count tokens locally: {}", e);
                None
            }
        }
    }

    async fn is_translating(&self, session_id: &str) -> bool {
        matches!(
            self.repo.get_session(session_id).await,
            Ok(Some(session)) if session.status == SessionStatus::Translating
        )
    }

    pub(crate) async fn progress_of(&self, session_id: &str) -> EngineResult<Progress> {
        let chunks = self.repo.list_chunks(session_id).await?;
        Ok(Progress::from_chunks(&chunks))
    }

    pub(crate) fn publish_status(&self, session: &SessionRecord, progress: Progress) {
        self.bus.publish(
            &session.id,
            &TranslationEvent::SessionStatus {
                session_id: session.id.clone(),
                status: session.status,
                progress,
            },
        );
    }
}
