use anyhow::{anyhow, Context, Result};
use futures::future::try_join_all;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::app_config::Config;
use crate::database::models::{ChunkPage, ChunkStatus, SessionRecord, SessionStatus};
use crate::database::{SessionRepository, SqliteRepository};
use crate::errors::AppError;
use crate::file_utils::FileManager;
use crate::providers::{self, Provider};
use crate::session::{ResumePlan, SessionCreateParams, SessionInfo, SourceInput};
use crate::translation::{Orchestrator, TemplateContext, TokenCounter, TranslationEvent};

// @module: Application controller for the command line

/// Outcome of translating one file
#[derive(Debug, Clone)]
pub struct TranslateOutcome {
    pub session: SessionRecord,
    /// Where the translation was written, if anything was
    pub output_path: Option<PathBuf>,
}

/// Main application controller for document translation
pub struct Controller {
    // @field: App configuration
    config: Config,
    // @field: Engine over the configured store and provider
    orchestrator: Orchestrator,
}

impl Controller {
    // @method: Open the configured database and provider
    pub async fn open(config: Config) -> Result<Self> {
        let repo = match &config.database_path {
            Some(path) => SqliteRepository::new(crate::database::DatabaseConnection::new(path)?),
            None => SqliteRepository::new_default()?,
        };
        debug!("Session store at {:?}", repo.connection().path());
        let provider = providers::create_provider(&config.translation)?;
        let counter = match &config.engine.tokenizer_path {
            Some(path) => Some(TokenCounter::from_path(path)?),
            None => None,
        };
        let controller = Self::with_parts(config, Arc::new(repo), provider);
        if let Some(counter) = counter {
            controller.orchestrator.set_token_counter(counter)?;
        }

        controller.orchestrator.recover_interrupted().await?;
        Ok(controller)
    }

    // @method: Build a controller over explicit parts
    pub fn with_parts(config: Config, repo: Arc<dyn SessionRepository>, provider: Arc<dyn Provider>) -> Self {
        let orchestrator = Orchestrator::new(repo, provider, config.engine.clone());
        Self { config, orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn template(&self) -> TemplateContext {
        TemplateContext::from_config(&self.config)
    }

    /// Translate a text file, resuming the session built from the same
    /// source if there is one
    pub async fn translate_file(&self, input_file: &Path, output_dir: &Path, force_overwrite: bool) -> Result<TranslateOutcome> {
        let start_time = std::time::Instant::now();
        if !FileManager::file_exists(input_file) {
            return Err(AppError::File(format!("Input file does not exist: {:?}", input_file)).into());
        }

        let output_path = FileManager::generate_output_path(input_file, output_dir, &self.config.target_language, "txt");
        if output_path.exists() && !force_overwrite {
            warn!("Skipping file, translation already exists (use -f to force overwrite)");
            let session = self.session_for_existing_output(input_file).await?;
            return Ok(TranslateOutcome { session, output_path: None });
        }

        let filename = FileManager::file_name(input_file);
        let bytes = FileManager::read_bytes(input_file)?;
        let input = SourceInput::File { filename: filename.clone(), bytes };
        let (text, _) = input.clone().decode()?;

        let plan = ResumePlan::for_existing(self.orchestrator.find_session_by_source(&text).await?);
        if let Some(existing) = plan.session() {
            info!("Found previous session {} ({})", existing.short_id(), existing.status);
        }

        let session_id = match &plan {
            ResumePlan::Fresh => {
                let session = self.orchestrator.create_session(SessionCreateParams::new(&filename)).await?;
                self.orchestrator.ingest_source(&session.id, input).await?;
                session.id
            }
            other => other.session().map(|s| s.id.clone()).unwrap_or_default(),
        };

        info!(
            "Translating {} with {} - {}",
            filename,
            self.config.translation.provider.display_name(),
            self.config.translation.get_model()
        );

        let ctx = self.template();
        let session = match plan {
            ResumePlan::AlreadyCompleted(session) => session,
            ResumePlan::Fresh | ResumePlan::Start(_) => {
                self.follow(&session_id, self.orchestrator.start_run(&session_id, ctx)).await?
            }
            ResumePlan::Resume(_) => {
                // Failed chunks would otherwise stall the resumed run
                if self.orchestrator.get_progress(&session_id).await?.failed > 0 {
                    self.follow(&session_id, self.orchestrator.retry_failed_chunks(&session_id, ctx)).await?
                } else {
                    self.follow(&session_id, self.orchestrator.resume_run(&session_id, ctx)).await?
                }
            }
            ResumePlan::RetryFailed(_) => {
                self.follow(&session_id, self.orchestrator.retry_failed_chunks(&session_id, ctx)).await?
            }
        };

        let output_path = self.write_result(&session, &output_path).await?;
        info!("Translation finished in {}.", Self::format_duration(start_time.elapsed()));
        Ok(TranslateOutcome { session, output_path })
    }

    async fn session_for_existing_output(&self, input_file: &Path) -> Result<SessionRecord> {
        let (text, _) = SourceInput::File {
            filename: FileManager::file_name(input_file),
            bytes: FileManager::read_bytes(input_file)?,
        }
        .decode()?;
        self.orchestrator
            .find_session_by_source(&text)
            .await?
            .ok_or_else(|| anyhow!("No session found for {:?}", input_file))
    }

    /// Resume a paused session and wait for it
    pub async fn resume(&self, session_id: &str) -> Result<SessionRecord> {
        let ctx = self.template();
        self.follow(session_id, self.orchestrator.resume_run(session_id, ctx)).await
    }

    /// Requeue the failed chunks of a session and wait for the run
    pub async fn retry(&self, session_id: &str) -> Result<SessionRecord> {
        let ctx = self.template();
        self.follow(session_id, self.orchestrator.retry_failed_chunks(session_id, ctx)).await
    }

    /// Start a run with a progress bar fed by the event bus and wait for it
    /// to drain
    async fn follow<F>(&self, session_id: &str, start: F) -> Result<SessionRecord>
    where
        F: std::future::Future<Output = crate::errors::EngineResult<SessionRecord>>,
    {
        let progress = self.orchestrator.get_progress(session_id).await?;
        let progress_bar = ProgressBar::new(progress.total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg} {eta}")
            .or_else(|_| ProgressStyle::default_bar().template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} ({percent}%) {msg}"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress_bar.set_style(style.progress_chars("█▓▒░"));
        progress_bar.set_position(progress.completed as u64);
        progress_bar.set_message("Translating");

        let (subscription, mut events) = self.orchestrator.subscribe_channel(session_id);
        let pb = progress_bar.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TranslationEvent::ChunkProgress { chunk, progress, .. } => {
                        pb.set_position(progress.completed as u64);
                        if chunk.status == ChunkStatus::Failed {
                            pb.set_message(format!("{} failed", progress.failed));
                        }
                    }
                    TranslationEvent::SessionStatus { status, .. } => {
                        pb.set_message(status.to_string());
                    }
                    TranslationEvent::SessionComplete { progress, .. } => {
                        pb.set_position(progress.completed as u64);
                    }
                    TranslationEvent::ChunkStart { .. } => {}
                }
            }
        });

        let started = start.await;
        let finished = match started {
            Ok(_) => self.orchestrator.wait_for_run(session_id).await,
            Err(e) => Err(e),
        };

        subscription.unsubscribe();
        let _ = listener.await;
        progress_bar.finish_and_clear();

        Ok(finished?)
    }

    /// Write the full translation, or the partial one when chunks are
    /// missing
    async fn write_result(&self, session: &SessionRecord, output_path: &Path) -> Result<Option<PathBuf>> {
        if session.status == SessionStatus::Completed {
            let text = session.translated_text.clone().unwrap_or_default();
            FileManager::write_to_file(output_path, &text)?;
            info!("Success: {:?}", output_path);
            return Ok(Some(output_path.to_path_buf()));
        }

        let progress = self.orchestrator.get_progress(&session.id).await?;
        warn!(
            "Session {} is {} with {} failed and {} pending chunk(s); retry with `chunkwise retry {}`",
            session.short_id(),
            session.status,
            progress.failed,
            progress.pending,
            session.id
        );
        let partial = self.orchestrator.get_partial_translation(&session.id).await?;
        if partial.is_empty() {
            return Ok(None);
        }
        let partial_path = output_path.with_extension("partial.txt");
        FileManager::write_to_file(&partial_path, &partial)?;
        info!("Partial translation written to {:?}", partial_path);
        Ok(Some(partial_path))
    }

    /// All sessions with their progress
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let sessions = self.orchestrator.list_sessions(None).await?;
        let progress = try_join_all(sessions.iter().map(|s| self.orchestrator.get_progress(&s.id))).await?;
        Ok(sessions
            .iter()
            .zip(progress)
            .map(|(session, progress)| SessionInfo::from_record(session, progress))
            .collect())
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let session = self.orchestrator.get_session(session_id).await?;
        let progress = self.orchestrator.get_progress(session_id).await?;
        Ok(SessionInfo::from_record(&session, progress))
    }

    pub async fn list_chunks(&self, session_id: &str, page: usize, status: Option<ChunkStatus>) -> Result<ChunkPage> {
        Ok(self.orchestrator.list_chunks(session_id, page, status).await?)
    }

    /// Completed translation, or the partial one
    pub async fn export(&self, session_id: &str, output: Option<&Path>) -> Result<String> {
        let session = self.orchestrator.get_session(session_id).await?;
        let text = match session.translated_text.as_deref() {
            Some(text) if session.status == SessionStatus::Completed => text.to_string(),
            _ => self.orchestrator.get_partial_translation(session_id).await?,
        };
        if let Some(path) = output {
            FileManager::write_to_file(path, &text).context("Failed to export translation")?;
            info!("Exported session {} to {:?}", session.short_id(), path);
        }
        Ok(text)
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.orchestrator.delete_session(session_id).await?)
    }

    // @formats: Duration as human readable string
    fn format_duration(duration: std::time::Duration) -> String {
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}.{:03}s", seconds, duration.subsec_millis())
        }
    }
}
