//! Error types for illust-dl
//!
//! This module provides the error handling for the library:
//! - Domain-specific error types (Database, Transfer, Download)
//! - Invariant violations raised by the state machine
//! - Cancellation as a distinct, non-error outcome marker

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for illust-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for illust-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Transfer of a resource failed
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Download-related error (lookup or state)
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// A state-machine contract was broken (e.g. Paused and Cancelled siblings)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation observed its own triggered cancellation handle
    #[error("operation cancelled")]
    Cancelled,

    /// The post-completion hook of a group failed
    #[error("post-completion hook failed: {0}")]
    Hook(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is the cancellation marker rather than a real failure
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Transfer(TransferError::Cancelled)
        )
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failures of a single transfer attempt
#[derive(Debug, Error)]
pub enum TransferError {
    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Http {
        /// HTTP status code returned by the server
        status: u16,
        /// The URL that was requested
        url: String,
    },

    /// Connection, DNS, TLS or timeout failure
    #[error("network error: {0}")]
    Network(String),

    /// Timed out waiting for the server
    #[error("timed out fetching {0}")]
    Timeout(String),

    /// Writing the received bytes failed
    #[error("failed to write {path}: {source}")]
    Io {
        /// The file being written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The transfer's cancellation token was triggered
    #[error("transfer cancelled")]
    Cancelled,

    /// The source yielded no bytes at all
    #[error("empty response body for {0}")]
    EmptyBody(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            TransferError::Timeout(url)
        } else if let Some(status) = e.status() {
            TransferError::Http {
                status: status.as_u16(),
                url,
            }
        } else {
            TransferError::Network(e.to_string())
        }
    }
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Group not registered with the manager
    #[error("download group {id} not found")]
    GroupNotFound {
        /// The group ID that was not found
        id: i64,
    },

    /// Member index out of range for its group
    #[error("task {index} not found in group {group}")]
    TaskNotFound {
        /// The group that was searched
        group: i64,
        /// The member index that was requested
        index: usize,
    },
}
