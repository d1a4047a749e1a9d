//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client key could not be resolved from a request
    #[error("Key resolution error: {0}")]
    KeyResolution(#[from] KeyResolutionError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to derive a client key from a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyResolutionError {
    /// No identity header and no remote address attached to the request
    #[error("no identity header and no remote address available")]
    MissingRemoteAddr,

    /// The remote address could not be split into host and port
    #[error("malformed remote address {addr:?}: {reason}")]
    Malformed {
        addr: String,
        reason: &'static str,
    },
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
