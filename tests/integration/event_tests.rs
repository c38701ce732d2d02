/*!
 * Integration tests for event delivery during runs
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;

use chunkwise::database::models::{ChunkStatus, SessionStatus};
use chunkwise::providers::mock::MockProvider;
use chunkwise::translation::FailurePolicy;
use chunkwise::TranslationEvent;
use crate::common::{self, ALPHABET_25};

fn recorder() -> (Arc<Mutex<Vec<TranslationEvent>>>, impl Fn(&TranslationEvent) + Send + Sync + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &TranslationEvent| sink.lock().push(event.clone()))
}

/// Short label per event, to compare sequences
fn label(event: &TranslationEvent) -> String {
    match event {
        TranslationEvent::ChunkStart { order, .. } => format!("start:{}", order),
        TranslationEvent::ChunkProgress { chunk, progress, .. } => {
            format!("progress:{}:{}:{}", chunk.order, chunk.status, progress.completed)
        }
        TranslationEvent::SessionStatus { status, .. } => format!("status:{}", status),
        TranslationEvent::SessionComplete { .. } => "complete".to_string(),
    }
}

/// Test a sequential run publishes its events in order
#[tokio::test]
async fn test_events_withSequentialRun_shouldArriveInOrder() -> Result<()> {
    let engine = common::engine_with(MockProvider::working(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;
    let (events, handler) = recorder();
    let _subscription = engine.orchestrator.subscribe(&session.id, handler);

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    let labels: Vec<String> = events.lock().iter().map(label).collect();
    assert_eq!(
        labels,
        vec![
            "status:translating",
            "start:0",
            "progress:0:completed:1",
            "start:1",
            "progress:1:completed:2",
            "start:2",
            "progress:2:completed:3",
            "status:completed",
            "complete",
        ]
    );

    let events = events.lock();
    assert!(events.iter().all(|e| e.session_id() == session.id));
    match events.last() {
        Some(TranslationEvent::SessionComplete { translated_text, progress, .. }) => {
            assert_eq!(translated_text, &common::expected_echo(&["abcdefghij", "klmnopqrst", "uvwxy"]));
            assert_eq!(progress.percent, 100);
        }
        other => panic!("unexpected last event: {:?}", other),
    }
    Ok(())
}

/// Test failures are reported as chunk progress and a final status
#[tokio::test]
async fn test_events_withFailingProvider_shouldReportFailedChunks() -> Result<()> {
    let engine = common::engine_with(MockProvider::failing(), common::settings(10, 1, FailurePolicy::default()));
    let session = engine.ready_session(ALPHABET_25).await?;
    let (events, handler) = recorder();
    let _subscription = engine.orchestrator.subscribe(&session.id, handler);

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    let events = events.lock();
    let failed = events
        .iter()
        .filter(|e| matches!(e, TranslationEvent::ChunkProgress { chunk, .. } if chunk.status == ChunkStatus::Failed))
        .count();
    assert_eq!(failed, 3);
    assert!(matches!(
        events.last(),
        Some(TranslationEvent::SessionStatus { status: SessionStatus::Failed, .. })
    ));
    assert!(!events.iter().any(|e| matches!(e, TranslationEvent::SessionComplete { .. })));
    Ok(())
}

/// Test subscribers only see their own session
#[tokio::test]
async fn test_events_withTwoSessions_shouldStayIsolated() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let watched = engine.ready_session(ALPHABET_25).await?;
    let other = engine.ready_session("Some other text to translate.").await?;
    let (events, handler) = recorder();
    let _subscription = engine.orchestrator.subscribe(&watched.id, handler);

    engine.orchestrator.start_run(&other.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&other.id).await?;

    assert!(events.lock().is_empty());
    Ok(())
}

/// Test the channel subscriber and teardown of the session channel
#[tokio::test]
async fn test_subscribeChannel_afterRun_shouldCloseAndTearDown() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(ALPHABET_25).await?;
    let (subscription, mut receiver) = engine.orchestrator.subscribe_channel(&session.id);
    assert_eq!(engine.orchestrator.bus().subscriber_count(&session.id), 1);

    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;
    drop(subscription);

    let mut received = Vec::new();
    while let Some(event) = receiver.recv().await {
        received.push(event);
    }
    assert!(matches!(received.last(), Some(TranslationEvent::SessionComplete { .. })));
    let starts = received
        .iter()
        .filter(|e| matches!(e, TranslationEvent::ChunkStart { .. }))
        .count();
    assert_eq!(starts, 3);

    // The run task releases its lease right after signalling completion
    for _ in 0..100 {
        if engine.orchestrator.bus().channel_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.orchestrator.bus().channel_count(), 0);
    Ok(())
}

/// Test events of manual operations
#[tokio::test]
async fn test_events_withManualRetry_shouldPublishChunkAndCompletion() -> Result<()> {
    let engine = common::engine(MockProvider::failing_on("uvw"));
    let session = engine.ready_session(ALPHABET_25).await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;
    let failed = engine.chunks(&session.id).await?.remove(2);

    let (events, handler) = recorder();
    let _subscription = engine.orchestrator.subscribe(&session.id, handler);
    engine.provider.set_behavior(chunkwise::providers::mock::MockBehavior::Working);
    engine.orchestrator.retry_chunk(failed.id, common::ctx()).await?;

    let labels: Vec<String> = events.lock().iter().map(label).collect();
    assert_eq!(labels, vec!["start:2", "progress:2:completed:3", "status:completed", "complete"]);
    assert_eq!(events.lock()[0].chunk_position(), Some((failed.id, 2)));
    Ok(())
}
