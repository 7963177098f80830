//! Local provider for StackFlow
//!
//! This crate implements the `ResourceProvider` trait on top of the local
//! filesystem, so deployments can be planned, applied and destroyed without
//! any cloud account.
//!
//! # Features
//!
//! - One JSON document per resource under `.stackflow/local/`
//! - Kind-specific outputs (`vpc_id`, `bucket_arn`, `endpoint_address`, ...)
//! - Rejects in-place changes to immutable fields
//!
//! # Example
//!
//! ```ignore
//! use stackflow_provider_local::LocalProvider;
//! use stackflow_engine::{Executor, FileStateStore};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(LocalProvider::new(".stackflow"));
//! let store = Arc::new(FileStateStore::new(".stackflow"));
//! let executor = Executor::new(provider, store);
//! ```

pub mod error;
pub mod provider;

pub use error::{LocalError, Result};
pub use provider::{LocalProvider, LocalResource};
