/*!
 * Error types for the chunkwise engine.
 *
 * This module contains custom error types for the different layers of the
 * application, using the thiserror crate for ergonomic error definitions:
 * - `ProviderError`: failures reported by a generation provider
 * - `RepositoryError`: failures reported by a session/chunk store
 * - `EngineError`: the taxonomy surfaced by orchestrator commands
 * - `AppError`: the CLI-level wrapper
 */

use thiserror::Error;

/// Errors that can occur when working with provider APIs
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Error when making an API request fails
    #[error("API request failed: {0}")]
    RequestFailed(String),

    /// Error when parsing an API response fails
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Error returned by the API itself
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Error message from the API
        message: String,
    },

    /// Error establishing or maintaining a connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error related to rate limiting
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Error with authentication
    #[error("Authentication error: {0}")]
    AuthenticationError(String),
}

impl ProviderError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RequestFailed(_) => "request_failed",
            ProviderError::ParseError(_) => "parse_error",
            ProviderError::ApiError { .. } => "api_error",
            ProviderError::ConnectionError(_) => "connection_error",
            ProviderError::RateLimitExceeded(_) => "rate_limited",
            ProviderError::AuthenticationError(_) => "authentication_error",
        }
    }

    /// Whether a transport-level retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::ConnectionError(_) | ProviderError::RateLimitExceeded(_) => true,
            ProviderError::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

/// Errors reported by a session/chunk repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The entity does not exist (any more)
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("session", "chunk")
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The entity exists but is not in the expected state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl RepositoryError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "session", id: id.into() }
    }

    pub fn chunk_not_found(id: i64) -> Self {
        Self::NotFound { entity: "chunk", id: id.to_string() }
    }
}

/// Errors surfaced by orchestrator commands
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input (empty source text, zero chunk size, blank title...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not legal in the current session or chunk status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown session or chunk id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent claim of a chunk that is already in flight
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream generation failure
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(anyhow::Error),
}

impl From<RepositoryError> for EngineError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound { .. } => Self::NotFound(error.to_string()),
            RepositoryError::Conflict(message) => Self::Conflict(message),
            RepositoryError::Storage(e) => Self::Storage(e),
        }
    }
}

/// Result type used by orchestrator commands
pub type EngineResult<T> = Result<T, EngineError>;

/// Main application error type that wraps all other errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from a file operation
    #[error("File error: {0}")]
    File(String),

    /// Error from a provider
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Error from the translation engine
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Any other error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Utility functions for error conversion
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::Unknown(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::File(error.to_string())
    }
}
