/*!
 * Persistent storage of sessions and their chunks.
 *
 * - `store`: the `SessionRepository` capability the orchestrator consumes
 * - `repository`: its SQLite implementation
 * - `connection` / `schema`: file handling and table definitions
 * - `models`: records exchanged across the boundary
 */

pub mod connection;
pub mod models;
pub mod repository;
pub mod schema;
pub mod store;

use sha2::{Digest, Sha256};

pub use connection::DatabaseConnection;
pub use repository::SqliteRepository;
pub use store::{RepoResult, SessionRepository};

/// SHA256 hex digest used to recognise previously ingested sources
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
