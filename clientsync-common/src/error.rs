//! Common error types for clientsync

use thiserror::Error;

/// Common result type for clientsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the clientsync crates
///
/// Records that cannot be resolved to an identity key are not errors: the
/// grouping layer drops and counts them instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The external claim collaborator rejected or failed the claim
    ///
    /// `status` is the upstream HTTP status when one was received.
    #[error("Upstream claim failure: {message}")]
    UpstreamClaim {
        status: Option<u16>,
        message: String,
    },

    /// A live connection could not accept a frame
    #[error("Transport write failure: {0}")]
    Transport(String),

    /// Cached view eviction failed
    #[error("Cache invalidation failure: {0}")]
    Cache(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an upstream claim failure from a status and message
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::UpstreamClaim {
            status,
            message: message.into(),
        }
    }
}
