//! Error types for the difftrain system

use thiserror::Error;

/// Main error type for difftrain operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, raised at startup before any resource allocation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint present on disk but unreadable or corrupt. Fatal: there is
    /// no automatic fallback to a scratch start, the operator must remove the
    /// bad file.
    #[error("Resume error: {0}")]
    Resume(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checkpoint container error
    #[error("Checkpoint container error: {0}")]
    Container(#[from] safetensors::SafeTensorError),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for difftrain operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a resume error
    pub fn resume(msg: impl Into<String>) -> Self {
        Self::Resume(msg.into())
    }
}
