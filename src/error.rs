//! Error types for cache operations.
//!
//! Callers need to tell three situations apart to pick the right fallback:
//!
//! - **bad request**: [`Error::ValidationError`], never reaches the breaker or a backend
//! - **system degraded**: [`Error::CircuitOpen`] and [`Error::BackendError`]
//! - **data not present**: not an error at all, reads return `Ok(None)`
//!
//! [`Error::Cancelled`] is reported when a caller-supplied signal aborted an
//! in-flight backend call. It is never counted against the circuit breaker.

use thiserror::Error as ThisError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the cache engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Key or value rejected before any breaker or backend interaction.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The circuit breaker rejected the call; the backend was not contacted.
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// The backing store reported a failure.
    #[error("Backend error: {0}")]
    BackendError(String),

    /// A caller-supplied cancellation or timeout signal fired first.
    #[error("Operation cancelled before the backend responded")]
    Cancelled,

    /// Value could not be encoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stored payload could not be decoded.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Stored bytes are not a cache envelope (bad magic, truncated header).
    #[error("Invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Envelope was written by an incompatible schema version.
    #[error("Cache entry version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u16, found: u16 },

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No backend node is registered to serve the key.
    #[error("No cache nodes available")]
    NoNodes,
}

impl Error {
    /// True for rejected input (empty key, oversized key or value).
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::ValidationError(_))
    }

    /// True when the breaker failed the call fast.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// True when the backing store itself failed.
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::BackendError(_))
    }

    /// True when the caller's own signal aborted the call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True when the cache tier is unhealthy and callers should go
    /// straight to their source of truth.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Error::BackendError(_) | Error::CircuitOpen { .. } | Error::NoNodes
        )
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::DeserializationError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::DeserializationError(e.to_string())
    }
}
