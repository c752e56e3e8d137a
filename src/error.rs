//! Error definitions shared across backends.

use thiserror::Error;

/// Errors raised by key-value store operations.
///
/// The severity split drives the watch engine: `Unavailable` triggers
/// backoff before the next attempt, `Protocol` re-arms immediately, and
/// `Fatal` terminates the watch for good.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be reached (connection refused, timeout, all
    /// hosts down). Retried with exponential backoff.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The store answered but the exchange could not be completed
    /// (malformed payload, unexpected status, rejected operation).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session or client is permanently unusable. Watches observing
    /// this error stop instead of retrying.
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

/// Errors raised while constructing a configuration source.
#[derive(Debug, Error)]
pub enum InitError {
    /// No hosts were configured for a backend that requires them.
    #[error("no {backend} hosts configured (set `{key}`)")]
    NoHosts {
        backend: &'static str,
        key: &'static str,
    },

    /// A configured endpoint could not be parsed.
    #[error("invalid {backend} endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        backend: &'static str,
        endpoint: String,
        reason: String,
    },

    /// The requested backend was not compiled into this build.
    #[error("{backend} support not compiled in (enable the `{backend}` cargo feature)")]
    Unsupported { backend: &'static str },

    /// The underlying client could not be constructed.
    #[error("client construction failed: {0}")]
    Client(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
