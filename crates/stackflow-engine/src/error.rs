//! Engine error types

use crate::provider::ProviderError;
use stackflow_core::ConfigError;
use thiserror::Error;

/// Errors raised while planning, applying or persisting state
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The stored revision no longer matches the one the caller read.
    #[error("State conflict on {address}: {message} (re-run `plan` to refresh)")]
    StateConflict { address: String, message: String },

    /// Two plan entries for the same address. Always a bug in the planner.
    #[error("Plan conflict: {0} (this is a bug, please report it)")]
    PlanConflict(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn state_conflict(address: impl ToString, message: impl Into<String>) -> Self {
        EngineError::StateConflict {
            address: address.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
