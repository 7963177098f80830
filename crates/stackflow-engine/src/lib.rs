//! StackFlow Engine
//!
//! Turns a dependency graph and the recorded state into a plan, and applies
//! that plan through a [`ResourceProvider`], recording every completed call in
//! a [`StateStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  StackFlow CLI                   │
//! │            (stack plan/apply/destroy)            │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               stackflow-engine                   │
//! │  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │   planner    │  │  executor (JoinSet pool)  │ │
//! │  └──────────────┘  └──────────────────────────┘ │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait ResourceProvider / trait StateStore │  │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │ local provider│ │ state/*.json  │
//! └───────────────┘ └───────────────┘
//! ```

pub mod action;
pub mod error;
pub mod executor;
pub mod planner;
pub mod provider;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use action::{
    Action, ApplyReport, Change, Plan, PlanSummary, Step, StepOp, StepOutcome, StepStatus,
};
pub use error::{EngineError, Result};
pub use executor::{ApplyEvent, CancelToken, Cancellation, Executor, ExecutorOptions};
pub use planner::{config_hash, plan, plan_destroy};
pub use provider::{
    Outputs, ProviderError, ProviderErrorClass, ProviderHandle, ProviderResult, ResolvedConfig,
    ResourceProvider, RetryConfig,
};
pub use state::{
    FileStateStore, MemoryStateStore, StateLock, StateRecord, StateSnapshot, StateStore,
};
