/*!
 * Tests for session creation, editing and ingestion
 */

use anyhow::Result;
use chunkwise::database::models::{SessionStatus, SessionUpdate};
use chunkwise::providers::mock::MockProvider;
use chunkwise::session::{ResumePlan, SessionCreateParams, SourceInput};
use chunkwise::EngineError;
use crate::common;

/// Test a new session starts as an empty draft
#[tokio::test]
async fn test_createSession_withTitle_shouldStartAsDraft() -> Result<()> {
    let engine = common::engine(MockProvider::working());

    let session = engine
        .orchestrator
        .create_session(
            SessionCreateParams::new("  Moby Dick  ")
                .with_memo("chapter one")
                .with_dictionary("Ishmael=Ismaël"),
        )
        .await?;

    assert_eq!(session.title, "Moby Dick");
    assert_eq!(session.status, SessionStatus::Draft);
    assert_eq!(session.total_chunks, 0);
    assert_eq!(session.memo.as_deref(), Some("chapter one"));

    let stored = tokio_test::assert_ok!(engine.orchestrator.get_session(&session.id).await);
    assert_eq!(stored.custom_dictionary.as_deref(), Some("Ishmael=Ismaël"));
    Ok(())
}

/// Test blank titles are rejected
#[tokio::test]
async fn test_createSession_withBlankTitle_shouldFailValidation() {
    let engine = common::engine(MockProvider::working());
    let result = engine.orchestrator.create_session(SessionCreateParams::new("   ")).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

/// Test editing a session
#[tokio::test]
async fn test_updateSession_shouldChangeOnlyGivenFields() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine
        .orchestrator
        .create_session(SessionCreateParams::new("Draft").with_memo("keep me"))
        .await?;

    let updated = engine
        .orchestrator
        .update_session(
            &session.id,
            SessionUpdate {
                title: Some(" Final ".to_string()),
                custom_dictionary: Some(Some("cat=chat".to_string())),
                ..Default::default()
            },
        )
        .await?;

    assert_eq!(updated.title, "Final");
    assert_eq!(updated.memo.as_deref(), Some("keep me"));
    assert_eq!(updated.custom_dictionary.as_deref(), Some("cat=chat"));

    let blank = engine
        .orchestrator
        .update_session(&session.id, SessionUpdate { title: Some(String::new()), ..Default::default() })
        .await;
    assert!(matches!(blank, Err(EngineError::Validation(_))));
    Ok(())
}

/// Test ingestion splits the text and readies the session
#[tokio::test]
async fn test_ingestSource_withText_shouldCreateOrderedChunks() -> Result<()> {
    let engine = common::engine(MockProvider::working());

    let session = engine.ready_session(common::ALPHABET_25).await?;

    assert_eq!(session.status, SessionStatus::Ready);
    assert_eq!(session.total_chunks, 3);
    assert_eq!(session.source_text.as_deref(), Some(common::ALPHABET_25));

    let chunks = engine.chunks(&session.id).await?;
    let orders: Vec<i64> = chunks.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(chunks[2].source_text, "uvwxy");
    Ok(())
}

/// Test re-ingesting a ready session replaces its chunks
#[tokio::test]
async fn test_ingestSource_onReadySession_shouldReplaceChunks() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session(common::ALPHABET_25).await?;

    let session = engine
        .orchestrator
        .ingest_source(
            &session.id,
            SourceInput::File { filename: "short.txt".to_string(), bytes: b"short".to_vec() },
        )
        .await?;

    assert_eq!(session.total_chunks, 1);
    assert_eq!(session.original_filename.as_deref(), Some("short.txt"));
    assert_eq!(engine.chunks(&session.id).await?.len(), 1);
    Ok(())
}

/// Test ingestion input validation
#[tokio::test]
async fn test_ingestSource_withInvalidInput_shouldFailValidation() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.orchestrator.create_session(SessionCreateParams::new("Doc")).await?;

    let blank = engine
        .orchestrator
        .ingest_source(&session.id, SourceInput::Text(" \n\t".to_string()))
        .await;
    assert!(matches!(blank, Err(EngineError::Validation(_))));

    let binary = engine
        .orchestrator
        .ingest_source(
            &session.id,
            SourceInput::File { filename: "image.png".to_string(), bytes: vec![0xff, 0xfe, 0x00, 0x89] },
        )
        .await;
    assert!(matches!(binary, Err(EngineError::Validation(_))));

    // Nothing was written
    let session = engine.orchestrator.get_session(&session.id).await?;
    assert_eq!(session.status, SessionStatus::Draft);
    Ok(())
}

/// Test ingestion is refused once a session has been translated
#[tokio::test]
async fn test_ingestSource_onCompletedSession_shouldFailInvalidState() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session("Short text.").await?;
    engine.orchestrator.start_run(&session.id, common::ctx()).await?;
    engine.orchestrator.wait_for_run(&session.id).await?;

    let result = engine
        .orchestrator
        .ingest_source(&session.id, SourceInput::Text("Other text.".to_string()))
        .await;

    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    Ok(())
}

/// Test unknown ids
#[tokio::test]
async fn test_sessionCommands_withUnknownId_shouldFailNotFound() {
    let engine = common::engine(MockProvider::working());

    let missing = tokio_test::assert_err!(engine.orchestrator.get_session("missing").await);
    assert!(matches!(missing, EngineError::NotFound(_)));
    assert!(matches!(
        engine.orchestrator.ingest_source("missing", SourceInput::Text("x".into())).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(engine.orchestrator.get_progress("missing").await, Err(EngineError::NotFound(_))));
    assert!(!engine.orchestrator.delete_session("missing").await.unwrap());
}

/// Test finding a previous session by its source text
#[tokio::test]
async fn test_findSessionBySource_shouldMatchOnTextOnly() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let session = engine.ready_session("The same words.").await?;

    let found = engine.orchestrator.find_session_by_source("The same words.").await?;
    assert_eq!(found.as_ref().map(|s| s.id.as_str()), Some(session.id.as_str()));
    assert!(matches!(ResumePlan::for_existing(found), ResumePlan::Start(_)));

    let missing = engine.orchestrator.find_session_by_source("Different words.").await?;
    assert!(matches!(ResumePlan::for_existing(missing), ResumePlan::Fresh));
    Ok(())
}

/// Test listing sessions by status
#[tokio::test]
async fn test_listSessions_withStatusFilter_shouldOnlyReturnMatches() -> Result<()> {
    let engine = common::engine(MockProvider::working());
    let ready = engine.ready_session("Ready text.").await?;
    engine.orchestrator.create_session(SessionCreateParams::new("Draft")).await?;

    let all = engine.orchestrator.list_sessions(None).await?;
    let ready_only = engine.orchestrator.list_sessions(Some(SessionStatus::Ready)).await?;

    assert_eq!(all.len(), 2);
    assert_eq!(ready_only.len(), 1);
    assert_eq!(ready_only[0].id, ready.id);
    Ok(())
}
