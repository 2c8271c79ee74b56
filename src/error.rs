//! Error types for KF Assist.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the reply engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Knowledge base error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Session store error: {0}")]
    SessionStore(#[from] SessionStoreError),

    #[error("Generative gateway error: {0}")]
    Generative(#[from] GenerativeError),

    #[error("Guard error: {0}")]
    Guard(#[from] GuardError),

    #[error("Automation surface error: {0}")]
    Surface(#[from] SurfaceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid rule pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Knowledge base snapshot errors.
///
/// Fatal only when the first snapshot is loaded at startup; a failed
/// hot reload keeps the previous snapshot.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Failed to read knowledge base {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Knowledge base {path} is not a valid JSON array: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("Session store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to write session store {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Session {id} is already checked out")]
    AlreadyCheckedOut { id: String },

    #[error("Session {id} was not checked out")]
    NotCheckedOut { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the external generative model gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerativeError {
    #[error("Generative call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Provider {provider} failed: {reason}")]
    ProviderError { provider: String, reason: String },
}

impl GenerativeError {
    /// Short label used as the decision's route reason.
    pub fn route_reason(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "generative_timeout",
            Self::RateLimited { .. } => "generative_rate_limited",
            Self::ProviderError { .. } => "generative_error",
        }
    }
}

/// Single-flight guard errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("A decision cycle is already in flight (ticket {held})")]
    Busy { held: u64 },

    #[error("Release of ticket {ticket} does not match the outstanding ticket {outstanding:?}")]
    ReleaseMismatch {
        ticket: u64,
        outstanding: Option<u64>,
    },
}

/// Automation surface (remote page) errors.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("Failed to poll unread conversations: {0}")]
    Poll(String),

    #[error("Failed to fetch transcript for {conversation_id}: {reason}")]
    Transcript {
        conversation_id: String,
        reason: String,
    },

    #[error("Failed to send to {conversation_id}: {reason}")]
    SendFailed {
        conversation_id: String,
        reason: String,
    },
}

/// Reply pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Session store failed: {0}")]
    SessionStore(#[from] SessionStoreError),

    #[error("Guard failed: {0}")]
    Guard(#[from] GuardError),

    #[error("Surface failed: {0}")]
    Surface(#[from] SurfaceError),
}

/// Result type alias for the reply engine.
pub type Result<T> = std::result::Result<T, Error>;
