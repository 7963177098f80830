//! Local provider error types

use stackflow_engine::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocalError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Field '{field}' of {kind} cannot be changed in place")]
    ImmutableField { kind: String, field: String },

    #[error("Kind mismatch for {handle}: recorded as {recorded}, requested as {requested}")]
    KindMismatch {
        handle: String,
        recorded: String,
        requested: String,
    },

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LocalError>;

impl From<LocalError> for ProviderError {
    fn from(err: LocalError) -> Self {
        match &err {
            LocalError::ResourceNotFound(_) => ProviderError::not_found(err.to_string()),
            LocalError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                ProviderError::not_found(err.to_string())
            }
            // Transient filesystem trouble (busy, interrupted, ...) may succeed later.
            LocalError::IoError(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                ProviderError::retryable(err.to_string())
            }
            _ => ProviderError::terminal(err.to_string()),
        }
    }
}
