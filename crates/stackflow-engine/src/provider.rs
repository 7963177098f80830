//! Resource provider trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackflow_core::{ResourceAddress, ResourceKind};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fully resolved resource configuration, as handed to a provider
pub type ResolvedConfig = serde_json::Map<String, serde_json::Value>;

/// Output attributes reported by `describe`
pub type Outputs = BTreeMap<String, String>;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Opaque identifier assigned by the provider on create
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderHandle(pub String);

impl ProviderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource provider abstraction
///
/// The engine never talks to infrastructure directly. Every mutation goes
/// through this trait, and only completed calls are recorded in state.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Returns the provider name (e.g., "local")
    fn name(&self) -> &str;

    /// Create a resource and return its handle
    async fn create(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
        config: &ResolvedConfig,
    ) -> ProviderResult<ProviderHandle>;

    /// Apply changed fields to an existing resource
    ///
    /// Fields removed from the declaration arrive as `null`.
    async fn update(
        &self,
        handle: &ProviderHandle,
        kind: ResourceKind,
        delta: &ResolvedConfig,
    ) -> ProviderResult<()>;

    /// Destroy a resource
    async fn destroy(&self, handle: &ProviderHandle, kind: ResourceKind) -> ProviderResult<()>;

    /// Read the output attributes of a resource
    async fn describe(&self, handle: &ProviderHandle, kind: ResourceKind)
    -> ProviderResult<Outputs>;
}

/// How a provider failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorClass {
    Timeout,
    RateLimited,
    Retryable,
    /// The resource does not exist (destroy treats this as done)
    NotFound,
    Terminal,
}

impl fmt::Display for ProviderErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorClass::Timeout => write!(f, "timeout"),
            ProviderErrorClass::RateLimited => write!(f, "rate limited"),
            ProviderErrorClass::Retryable => write!(f, "retryable"),
            ProviderErrorClass::NotFound => write!(f, "not found"),
            ProviderErrorClass::Terminal => write!(f, "terminal"),
        }
    }
}

/// Classified provider failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct ProviderError {
    pub class: ProviderErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn new(class: ProviderErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::RateLimited, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::Retryable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::NotFound, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorClass::Terminal, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class,
            ProviderErrorClass::Timeout
                | ProviderErrorClass::RateLimited
                | ProviderErrorClass::Retryable
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.class == ProviderErrorClass::NotFound
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay.max(0.0))
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}
