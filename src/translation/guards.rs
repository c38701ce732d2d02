/*!
 * Legal session and chunk transitions.
 */

use crate::database::models::{ChunkStatus, SessionStatus};
use crate::errors::{EngineError, EngineResult};

use SessionStatus::*;

/// Whether a session may move from `from` to `to`
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    match from {
        Draft => matches!(to, Ready),
        Ready => matches!(to, Ready | Translating | Failed | Completed),
        Translating => matches!(to, Paused | Completed | Failed),
        Paused => matches!(to, Translating | Completed | Failed | Ready),
        Completed => matches!(to, Paused | Translating | Ready),
        Failed => matches!(to, Paused | Translating | Ready),
    }
}

/// Every status from which `to` can be reached
pub fn sources_of(to: SessionStatus) -> Vec<SessionStatus> {
    SessionStatus::ALL
        .into_iter()
        .filter(|from| can_transition(*from, to))
        .collect()
}

/// Fail with `InvalidState` unless `from -> to` is legal
pub fn ensure_transition(from: SessionStatus, to: SessionStatus) -> EngineResult<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidState(format!(
            "session cannot move from {} to {}",
            from, to
        )))
    }
}

/// Fail with `InvalidState` unless the session is in one of `allowed`
pub fn ensure_session_status(current: SessionStatus, allowed: &[SessionStatus], action: &str) -> EngineResult<()> {
    if allowed.contains(&current) {
        return Ok(());
    }
    Err(EngineError::InvalidState(format!(
        "cannot {} a session that is {}",
        action, current
    )))
}

/// Chunk statuses a manual translation may claim from
pub const MANUAL_CLAIMABLE: [ChunkStatus; 3] = [ChunkStatus::Pending, ChunkStatus::Failed, ChunkStatus::Completed];

/// Statuses in which a session accepts manual chunk operations
pub const MANUAL_SESSION_STATES: [SessionStatus; 5] = [Ready, Translating, Paused, Completed, Failed];

/// Check a chunk may be claimed for manual translation
pub fn ensure_chunk_claimable(status: ChunkStatus, allowed: &[ChunkStatus]) -> EngineResult<()> {
    if allowed.contains(&status) {
        return Ok(());
    }
    match status {
        ChunkStatus::Processing => Err(EngineError::Conflict(
            "chunk is already being translated".to_string(),
        )),
        other => Err(EngineError::InvalidState(format!(
            "chunk is {}, expected one of {}",
            other,
            allowed.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
        ))),
    }
}
