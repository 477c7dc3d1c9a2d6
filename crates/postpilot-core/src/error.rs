//! Error types for PostPilot.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, PostPilotError>;

/// Top-level error taxonomy.
///
/// Credential resolution failures and provider rejections carry their
/// own richer types in the crates that own them; this enum is the
/// common currency for everything that crosses a crate boundary.
#[derive(Debug, Error)]
pub enum PostPilotError {
    /// Configuration file missing, unreadable, or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// SQLite storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Encryption/decryption of secret material failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Credential lifecycle failure (missing, refresh failed).
    #[error("credential error: {0}")]
    Credential(String),

    /// Provider API failure that escaped classification.
    #[error("provider error: {0}")]
    Provider(String),

    /// Task specification rejected at creation time.
    #[error("validation error: {0}")]
    Validation(String),

    /// Task lifecycle transition not allowed from the current status.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
