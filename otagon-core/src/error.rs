//! Error types for otagon-core

use crate::types::QuotaDecision;
use thiserror::Error;

/// Main error type for the otagon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// User not found
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Conversation not found
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// Conversation id already taken for this user
    #[error("conversation already exists: {0}")]
    ConversationExists(String),

    /// Query denied by the monthly quota
    #[error("quota exceeded: {}", .0.reason.as_deref().unwrap_or("limit reached"))]
    QuotaExceeded(QuotaDecision),

    /// Write based on a stale read
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict {
        id: String,
        expected: i64,
        found: i64,
    },

    /// Trial cannot be started
    #[error("trial unavailable: {0}")]
    TrialUnavailable(String),

    /// Invalid input from the caller
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for otagon-core
pub type Result<T> = std::result::Result<T, Error>;
