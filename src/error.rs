//! Error types for mass-dl
//!
//! One crate-wide [`Error`] covers the whole failure taxonomy of a mass download run:
//! - Validation errors (malformed UUIDs, empty identifiers, missing configuration)
//! - Transient operation errors (timeouts, rate limiting, flaky I/O) that the retry
//!   executor may retry
//! - Fatal operation errors (private or deleted channels, missing files) that are
//!   surfaced immediately
//! - Control-flow conditions (circuit open, cancellation, shutdown)
//!
//! Retry classification lives in [`crate::retry::IsRetryable`].

use thiserror::Error;

/// Result type alias for mass-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mass-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "remote_bucket")
        key: Option<String>,
    },

    /// Input failed validation (empty identifier, malformed UUID, unknown status)
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Remote service is rate limiting requests
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transient network failure (connection reset, DNS hiccup, 5xx)
    #[error("network error: {0}")]
    Network(String),

    /// Resource permanently missing (deleted video, unknown channel)
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource exists but cannot be accessed (private or terminated channel)
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// External transfer client failed in a way it did not classify
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Circuit breaker rejected the call without attempting it
    #[error("circuit open for operation '{operation}'")]
    CircuitOpen {
        /// Operation key the breaker guards (e.g., "remote-upload")
        operation: String,
    },

    /// All retry attempts failed
    #[error("operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation key that was retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// Sampling CPU or memory usage failed
    #[error("resource monitor error: {0}")]
    ResourceMonitor(String),

    /// Waiting for admission exceeded the job timeout
    #[error("admission timed out after {waited_secs:.1}s")]
    AdmissionTimeout {
        /// Seconds spent waiting before giving up
        waited_secs: f64,
    },

    /// The run was cancelled before this work started
    #[error("cancelled")]
    Cancelled,

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Shorthand for a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
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
}
