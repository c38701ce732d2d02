/*!
 * Integration tests for manual chunk operations racing bulk runs
 */

use anyhow::Result;
use chunkwise::database::models::{ChunkStatus, SessionStatus};
use chunkwise::providers::mock::MockProvider;
use chunkwise::translation::FailurePolicy;
use chunkwise::EngineError;
use crate::common::{self, ALPHABET_25};

/// Test a chunk is never submitted twice when a manual call races the run
#[tokio::test]
async fn test_translateChunk_duringRun_shouldNeverSubmitChunkTwice() -> Result<()> {
    let provider = MockProvider::working().gated();
    let engine = common::engine_with(provider.clone(), common::settings(10, 2, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;
    let chunks = engine.chunks(&session.id).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    provider.wait_for_calls(2).await;

    // Chunk 0 is in flight in the run
    let busy = engine.orchestrator.translate_chunk(chunks[0].id, common::ctx()).await;
    assert!(matches!(busy, Err(EngineError::Conflict(_))));

    // Chunk 2 is still pending: the manual call claims it first
    let orchestrator = engine.orchestrator.clone();
    let last = chunks[2].id;
    let manual = tokio::spawn(async move { orchestrator.translate_chunk(last, common::ctx()).await });
    provider.wait_for_calls(3).await;
    provider.release(3);

    let manual = manual.await??;
    assert_eq!(manual.status, ChunkStatus::Completed);
    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(provider.calls(), 3);
    for chunk in &chunks {
        let reference = format!("{}:{}", session.id, chunk.order);
        assert_eq!(provider.max_concurrency_for(&reference), 1, "chunk {} submitted twice", chunk.order);
    }
    assert_eq!(
        done.translated_text.as_deref(),
        Some(common::expected_echo(&["abcdefghij", "klmnopqrst", "uvwxy"]).as_str())
    );
    Ok(())
}

/// Test the worker pool never exceeds the configured concurrency
#[tokio::test]
async fn test_startRun_withManyChunks_shouldRespectConcurrencyLimit() -> Result<()> {
    let provider = MockProvider::slow(15);
    let engine = common::engine_with(provider.clone(), common::settings(5, 3, FailurePolicy::default()));
    let text = "0123456789".repeat(10);
    let session = engine.ready_session(&text).await?;
    assert_eq!(session.total_chunks, 20);

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(provider.calls(), 20);
    assert!(provider.max_concurrency() <= 3, "saw {} calls in flight", provider.max_concurrency());

    let expected: String = text
        .as_bytes()
        .chunks(5)
        .map(|c| MockProvider::echo("French", std::str::from_utf8(c).unwrap_or_default()))
        .collect();
    assert_eq!(done.translated_text.as_deref(), Some(expected.as_str()));
    Ok(())
}

/// Test two concurrent starts produce a single run
#[tokio::test]
async fn test_startRun_twiceConcurrently_shouldStartOnce() -> Result<()> {
    let provider = MockProvider::working().gated();
    let engine = common::engine_with(provider.clone(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;

    let (first, second) = tokio::join!(
        engine.orchestrator.start_run(&session.id, common::ctx()),
        engine.orchestrator.start_run(&session.id, common::ctx())
    );

    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let refused = first.err().or(second.err());
    assert!(matches!(refused, Some(EngineError::InvalidState(_))));

    provider.release(3);
    let done = engine.orchestrator.wait_for_run(&session.id).await?;
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(provider.calls(), 3);
    Ok(())
}

/// Test commands that need a quiet session are refused during a run
#[tokio::test]
async fn test_resetSession_duringRun_shouldFailInvalidState() -> Result<()> {
    let provider = MockProvider::working().gated();
    let engine = common::engine_with(provider.clone(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    provider.wait_for_calls(1).await;
    assert!(engine.orchestrator.has_active_run(&session.id));

    let reset = engine.orchestrator.reset_session(&session.id).await;
    assert!(matches!(reset, Err(EngineError::InvalidState(_))));

    provider.release(3);
    engine.orchestrator.wait_for_run(&session.id).await?;
    Ok(())
}

/// Test resume waits for the paused run to drain before starting again
#[tokio::test]
async fn test_resumeRun_beforePreviousRunDrained_shouldNotOverlap() -> Result<()> {
    let provider = MockProvider::working().gated();
    let engine = common::engine_with(provider.clone(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    provider.wait_for_calls(1).await;
    engine.orchestrator.pause_run(&session.id).await?;

    let orchestrator = engine.orchestrator.clone();
    let session_id = session.id.clone();
    let resume = tokio::spawn(async move { orchestrator.resume_run(&session_id, common::ctx()).await });

    // The in-flight chunk of the first run lands, then the second run takes over
    provider.release(3);
    resume.await??;
    let done = engine.orchestrator.wait_for_run(&session.id).await?;

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(provider.calls(), 3);
    assert_eq!(provider.max_concurrency(), 1);
    Ok(())
}

/// Test a pause stored right after a run starts stops it from claiming more
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pauseRun_rightAfterStart_shouldNotLoseThePause() -> Result<()> {
    for _ in 0..50 {
        let provider = MockProvider::working();
        let engine = common::engine_with(provider.clone(), common::settings(10, 1, FailurePolicy::default()));
        let session = engine.ready_session(ALPHABET_25).await?;

        let orchestrator = engine.orchestrator.clone();
        let watcher = provider.clone();
        let id = session.id.clone();
        let pauser = tokio::spawn(async move {
            loop {
                match orchestrator.get_session(&id).await.map(|s| s.status) {
                    Ok(SessionStatus::Translating) => {
                        return orchestrator.pause_run(&id).await.ok().map(|_| watcher.calls());
                    }
                    Ok(SessionStatus::Ready) => tokio::task::yield_now().await,
                    _ => return None,
                }
            }
        });

        engine.orchestrator.start_run(&session.id, common::ctx()).await?;
        let calls_at_pause = pauser.await?;
        let done = engine.orchestrator.wait_for_run(&session.id).await?;

        if let Some(calls_at_pause) = calls_at_pause {
            // One worker: at most the chunk already claimed can still run
            assert!(provider.calls() <= calls_at_pause + 1);
            if provider.calls() < 3 {
                assert_eq!(done.status, SessionStatus::Paused);
            }
        }
    }
    Ok(())
}
