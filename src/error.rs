//! Error types for the Throttle service.

use thiserror::Error;

/// Main error type for Throttle operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller passed a limit or window the limiter cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The shared store answered, but not with something we can use
    #[error("Store error: {0}")]
    Store(String),

    /// Transport errors talking to the shared store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Layered configuration loading errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThrottleError {
    /// Whether this error came from the shared store rather than the caller.
    pub fn is_backend(&self) -> bool {
        matches!(self, ThrottleError::Store(_) | ThrottleError::Http(_))
    }
}

/// Result type alias for Throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
