/*!
 * Integration tests for bulk runs, pause/resume and failure handling
 */

use anyhow::Result;
use chunkwise::database::models::{ChunkStatus, SessionStatus};
use chunkwise::providers::mock::{MockBehavior, MockProvider};
use chunkwise::providers::PromptContext;
use chunkwise::session::{SessionCreateParams, SourceInput};
use chunkwise::translation::{CustomDictionary, FailurePolicy, TokenCounter};
use chunkwise::EngineError;
use crate::common::{self, ALPHABET_25};

/// Test a full run translates every chunk and assembles them in order
#[tokio::test]
async fn test_startRun_withWorkingProvider_shouldCompleteInOrder() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;

    let started = engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    assert_eq!(started.status, SessionStatus::Translating);

    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(
        done.translated_text.as_deref(),
        Some(common::expected_echo(&["abcdefghij", "klmnopqrst", "uvwxy"]).as_str())
    );

    let progress = engine.orchestrator.get_progress(&session.id).await?;
    assert_eq!((progress.completed, progress.total, progress.percent), (3, 3, 100));
    assert_eq!(engine.provider.calls(), 3);

    for chunk in engine.chunks(&session.id).await? {
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert!(chunk.token_count.is_some());
        assert!(chunk.duration_ms.is_some());
        assert!(chunk.error_message.is_none());
    }
    assert!(!engine.orchestrator.has_active_run(&session.id));
    Ok(())
}

/// Test a failed chunk pauses the session and a manual retry completes it
#[tokio::test]
async fn test_retryChunk_afterPartialFailure_shouldCompleteSession() -> Result<()> {
    let engine = common::engine(MockProvider::failing_on("lmn"));
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let drained = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(drained.status, SessionStatus::Paused);
    let chunks = engine.chunks(&session.id).await?;
    let statuses: Vec<ChunkStatus> = chunks.iter().map(|c| c.status).collect();
    assert_eq!(statuses, vec![ChunkStatus::Completed, ChunkStatus::Failed, ChunkStatus::Completed]);
    assert!(chunks[1].error_message.as_deref().unwrap_or_default().contains("lmn"));
    assert_eq!(chunks[1].retry_count, 0);

    let partial = engine.orchestrator.get_partial_translation(&session.id).await?;
    assert_eq!(partial, common::expected_echo(&["abcdefghij", "uvwxy"]));

    engine.provider.set_behavior(MockBehavior::Working);
    let retried = engine.orchestrator.retry_chunk(chunks[1].id, common::ctx()).await?;

    assert_eq!(retried.status, ChunkStatus::Completed);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.error_message.is_none());

    let session = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.translated_text.as_deref(),
        Some(common::expected_echo(&["abcdefghij", "klmnopqrst", "uvwxy"]).as_str())
    );
    Ok(())
}

/// Test retrying a chunk that did not fail is refused
#[tokio::test]
async fn test_retryChunk_withCompletedChunk_shouldFailInvalidState() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;
    let chunk = engine.chunks(&session.id).await?.remove(0);

    let result = engine.orchestrator.retry_chunk(chunk.id, common::ctx()).await;

    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    assert!(matches!(
        engine.orchestrator.retry_chunk(9999, common::ctx()).await,
        Err(EngineError::NotFound(_))
    ));
    Ok(())
}

/// Test pausing stops scheduling after in-flight calls and resume finishes
#[tokio::test]
async fn test_pauseRun_midRun_shouldStopAfterInFlightChunk() -> Result<()> {
    let provider = MockProvider::working().gated();
    let engine = common::engine_with(provider.clone(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    provider.release(1);
    provider.wait_for_calls(2).await;

    let paused = engine.orchestrator.pause_run(&session.id).await?;
    assert_eq!(paused.status, SessionStatus::Paused);

    // The call in flight when pausing still lands
    provider.release(1);
    let drained = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(drained.status, SessionStatus::Paused);
    assert_eq!(provider.calls(), 2);
    let statuses: Vec<ChunkStatus> = engine.chunks(&session.id).await?.iter().map(|c| c.status).collect();
    assert_eq!(statuses, vec![ChunkStatus::Completed, ChunkStatus::Completed, ChunkStatus::Pending]);

    // Pausing again is a no-op
    let again = engine.orchestrator.pause_run(&session.id).await?;
    assert_eq!(again.status, SessionStatus::Paused);

    provider.release(1);
    engine.orchestrator.resume_run(&session.id, common::ctx()).await?;
    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(provider.calls(), 3);
    assert_eq!(provider.max_concurrency(), 1);
    Ok(())
}

/// Test run commands refused in the wrong status
#[tokio::test]
async fn test_runCommands_inWrongStatus_shouldFailInvalidState() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;

    assert!(matches!(
        engine.orchestrator.pause_run(&session.id).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        engine.orchestrator.resume_run(&session.id, common::ctx()).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        engine.orchestrator.retry_failed_chunks(&session.id, common::ctx()).await,
        Err(EngineError::InvalidState(_))
    ));

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;
    assert!(matches!(
        engine.orchestrator.start_run(&session.id, common::ctx()).await,
        Err(EngineError::InvalidState(_))
    ));
    Ok(())
}

/// Test a draft session cannot be run
#[tokio::test]
async fn test_startRun_withDraftSession_shouldFailInvalidState() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine
        .orchestrator
        .create_session(chunkwise::session::SessionCreateParams::new("Empty"))
        .await?;

    let result = engine.orchestrator.start_run(&session.id, common::ctx()).await;

    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    assert_eq!(engine.provider.calls(), 0);
    Ok(())
}

/// Test a template without `{text}` is refused before anything runs
#[tokio::test]
async fn test_startRun_withUnusableTemplate_shouldFailInvalidState() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;
    let mut ctx = common::ctx();
    ctx.template.user = "Translate this".to_string();

    let result = engine.orchestrator.start_run(&session.id, ctx).await;

    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    let session = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(session.status, SessionStatus::Ready);
    Ok(())
}

/// Test a run where nothing succeeds fails the session
#[tokio::test]
async fn test_failurePolicy_withAllChunksFailing_shouldFailSession() -> Result<()> {
    let engine = common::engine(MockProvider::failing());
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let drained = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(drained.status, SessionStatus::Failed);
    let progress = engine.orchestrator.get_progress(&session.id).await?;
    assert_eq!((progress.failed, progress.completed, progress.percent), (3, 0, 0));
    Ok(())
}

/// Test the hold policy keeps a stalled session paused
#[tokio::test]
async fn test_failurePolicy_withHold_shouldPauseSession() -> Result<()> {
    let engine = common::engine_with(MockProvider::failing(), common::settings(10, 2, FailurePolicy::Hold));
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let drained = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(drained.status, SessionStatus::Paused);
    Ok(())
}

/// Test an empty provider answer counts as a chunk failure
#[tokio::test]
async fn test_startRun_withEmptyResponses_shouldRecordFailures() -> Result<()> {
    let engine = common::engine(MockProvider::empty());
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let drained = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(drained.status, SessionStatus::Failed);
    for chunk in engine.chunks(&session.id).await? {
        assert_eq!(chunk.status, ChunkStatus::Failed);
        assert!(chunk.translated_text.is_none());
    }
    Ok(())
}

/// Test requeueing failed chunks from a failed session
#[tokio::test]
async fn test_retryFailedChunks_fromFailedSession_shouldComplete() -> Result<()> {
    let engine = common::engine(MockProvider::failing());
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    engine.provider.set_behavior(MockBehavior::Working);
    let restarted = engine.orchestrator.retry_failed_chunks(&session.id, common::ctx()).await?;
    assert_eq!(restarted.status, SessionStatus::Translating);
    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    for chunk in engine.chunks(&session.id).await? {
        assert_eq!(chunk.retry_count, 1);
    }
    assert_eq!(engine.provider.calls(), 6);
    Ok(())
}

/// Test a manual translation reopens a failed session
#[tokio::test]
async fn test_translateChunk_onFailedSession_shouldReopenIt() -> Result<()> {
    let engine = common::engine(MockProvider::failing());
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;
    let first = engine.chunks(&session.id).await?.remove(0);

    engine.provider.set_behavior(MockBehavior::Working);
    let chunk = engine.orchestrator.translate_chunk(first.id, common::ctx()).await?;

    assert_eq!(chunk.status, ChunkStatus::Completed);
    // Two chunks still failed: the session stays open, not failed
    let session = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(session.status, SessionStatus::Paused);
    Ok(())
}

/// Test retranslating a completed chunk keeps the session consistent
#[tokio::test]
async fn test_translateChunk_onCompletedSession_shouldReassemble() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;
    let last = engine.chunks(&session.id).await?.remove(2);

    let chunk = engine.orchestrator.translate_chunk(last.id, common::ctx()).await?;

    assert_eq!(chunk.status, ChunkStatus::Completed);
    assert_eq!(chunk.retry_count, 0);
    let session = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.translated_text.as_deref(),
        Some(common::expected_echo(&["abcdefghij", "klmnopqrst", "uvwxy"]).as_str())
    );
    assert_eq!(engine.provider.calls(), 4);
    Ok(())
}

/// Answers only when the session dictionary made it into the prompt
fn dictionary_aware(prompt: &PromptContext) -> String {
    let rendered = format!("{}\n{}", prompt.system_prompt, prompt.user_prompt);
    if rendered.contains("- a => b") && !rendered.contains("bad line") {
        format!("<{}>", prompt.source_text)
    } else {
        String::new()
    }
}

/// Test the session dictionary reaches every prompt of a run and of a retry
#[tokio::test]
async fn test_startRun_withDictionary_shouldInjectItIntoEveryPrompt() -> Result<()> {
    let provider = MockProvider::failing_on("lmn").with_custom_response(dictionary_aware);
    let engine = common::engine(provider.clone());
    let session = engine
        .orchestrator
        .create_session(SessionCreateParams::new("Glossary").with_dictionary("a=b\nbad line"))
        .await?;
    engine
        .orchestrator
        .ingest_source(&session.id, SourceInput::Text(ALPHABET_25.to_string()))
        .await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let paused = engine.orchestrator.wait_for_run(&session.id).await?;

    // The malformed line is skipped, the other two chunks still translate
    assert_eq!(paused.status, SessionStatus::Paused);
    let chunks = engine.chunks(&session.id).await?;
    let statuses: Vec<ChunkStatus> = chunks.iter().map(|c| c.status).collect();
    assert_eq!(statuses, vec![ChunkStatus::Completed, ChunkStatus::Failed, ChunkStatus::Completed]);

    provider.set_behavior(MockBehavior::Working);
    let retried = engine.orchestrator.retry_chunk(chunks[1].id, common::ctx()).await?;
    assert_eq!(retried.translated_text.as_deref(), Some("<klmnopqrst>"));

    let done = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.translated_text.as_deref(), Some("<abcdefghij><klmnopqrst><uvwxy>"));
    Ok(())
}

/// Test resetting a session returns every chunk to pending
#[tokio::test]
async fn test_resetSession_afterCompletion_shouldMakeSessionReady() -> Result<()> {
    let engine = common::engine(MockProvider::failing_on("abc"));
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    let reset = engine.orchestrator.reset_session(&session.id).await?;

    assert_eq!(reset.status, SessionStatus::Ready);
    assert!(reset.translated_text.is_none());
    for chunk in engine.chunks(&session.id).await? {
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.retry_count, 0);
        assert!(chunk.translated_text.is_none());
        assert!(chunk.error_message.is_none());
    }
    let progress = engine.orchestrator.get_progress(&session.id).await?;
    assert_eq!((progress.pending, progress.percent), (3, 0));
    Ok(())
}

/// Test deleting a session removes its chunks
#[tokio::test]
async fn test_deleteSession_shouldCascadeToChunks() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;
    let chunk = engine.chunks(&session.id).await?.remove(0);

    assert!(engine.orchestrator.delete_session(&session.id).await?);

    assert!(matches!(engine.orchestrator.get_progress(&session.id).await, Err(EngineError::NotFound(_))));
    assert!(engine.chunks(&session.id).await?.is_empty());
    assert!(matches!(
        engine.orchestrator.translate_chunk(chunk.id, common::ctx()).await,
        Err(EngineError::NotFound(_))
    ));
    Ok(())
}

/// Test deleting a session while its run is in flight
#[tokio::test]
async fn test_deleteSession_duringRun_shouldDrainQuietly() -> Result<()> {
    let provider = MockProvider::working().gated();
    let engine = common::engine_with(provider.clone(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    provider.wait_for_calls(1).await;
    assert!(engine.orchestrator.delete_session(&session.id).await?);
    provider.release(1);

    assert!(matches!(engine.orchestrator.wait_for_run(&session.id).await, Err(EngineError::NotFound(_))));
    assert!(!engine.orchestrator.has_active_run(&session.id));
    assert_eq!(provider.calls(), 1);
    Ok(())
}

/// Test chunk listing pages and filters
#[tokio::test]
async fn test_listChunks_withPagingAndFilter_shouldSliceInOrder() -> Result<()> {
    let engine = common::engine(MockProvider::failing_on("lmn"));
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    let first = engine.orchestrator.list_chunks(&session.id, 0, None).await?;
    let second = engine.orchestrator.list_chunks(&session.id, 1, None).await?;
    let failed = engine.orchestrator.list_chunks(&session.id, 0, Some(ChunkStatus::Failed)).await?;

    assert_eq!((first.items.len(), first.total, first.page_count()), (2, 3, 2));
    assert_eq!(first.items[0].order, 0);
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].order, 2);
    assert_eq!(failed.total, 1);
    assert_eq!(failed.items[0].order, 1);

    let past_end = engine.orchestrator.list_chunks(&session.id, 5, None).await?;
    assert!(past_end.items.is_empty());
    Ok(())
}

/// Test a run cut short by a crash is picked up again
#[tokio::test]
async fn test_recoverInterrupted_shouldPauseAndRequeue() -> Result<()> {
    use chunkwise::database::SessionRepository;

    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;
    let chunk = engine.chunks(&session.id).await?.remove(0);

    // Simulate a process that died mid-call
    engine
        .repo
        .transition_session(&session.id, &[SessionStatus::Ready], SessionStatus::Translating)
        .await?;
    engine.repo.claim_chunk(chunk.id, &[ChunkStatus::Pending], &[SessionStatus::Translating], false).await?;

    let report = engine.orchestrator.recover_interrupted().await?;

    assert_eq!(report.sessions_paused, 1);
    assert_eq!(report.chunks_requeued, 1);
    let session = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(session.status, SessionStatus::Paused);

    engine.orchestrator.resume_run(&session.id, common::ctx()).await?;
    let done = engine.orchestrator.wait_for_run(&session.id).await?;
    assert_eq!(done.status, SessionStatus::Completed);
    Ok(())
}

/// Test chunks get a local token count when the provider reports no usage
#[tokio::test]
async fn test_startRun_withoutReportedUsage_shouldCountTokensLocally() -> Result<()> {
    let engine = common::engine_with(
        MockProvider::working().without_usage(),
        common::settings(50, 1, FailurePolicy::default()),
    );
    let temp_dir = common::create_temp_dir()?;
    let path = common::create_test_file(temp_dir.path(), "tokenizer.json", common::WORD_TOKENIZER)?;
    engine.orchestrator.set_token_counter(TokenCounter::from_path(&path)?)?;
    let again = engine.orchestrator.set_token_counter(TokenCounter::from_path(&path)?);
    assert!(matches!(again, Err(EngineError::InvalidState(_))));

    let session = engine.ready_session("hello world").await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    let counter = TokenCounter::from_path(&path)?;
    let prompt = common::ctx().render("hello world", &CustomDictionary::default(), None);
    let expected = counter.count(&format!("{}\n{}", prompt.system_prompt, prompt.user_prompt))?
        + counter.count(&MockProvider::echo("French", "hello world"))?;
    let chunk = engine.chunks(&session.id).await?.remove(0);
    assert_eq!(chunk.token_count, Some(expected as i64));
    Ok(())
}

/// Test no count is stored when neither the provider nor a tokenizer gives one
#[tokio::test]
async fn test_startRun_withoutUsageOrTokenizer_shouldLeaveTokenCountEmpty() -> Result<()> {
    let engine = common::engine(MockProvider::working().without_usage());
    let session = engine.ready_session("Short text.").await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    assert!(engine.chunks(&session.id).await?.iter().all(|c| c.token_count.is_none()));
    Ok(())
}
