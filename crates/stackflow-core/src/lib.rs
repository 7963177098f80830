//! StackFlow Core
//!
//! デプロイメント宣言のデータモデル、依存グラフ構築、KDLパーサーを提供します。
//!
//! ```text
//! stack.kdl ──parser──▶ Deployment ──graph──▶ DependencyGraph ──▶ stackflow-engine
//! ```

pub mod error;
pub mod graph;
pub mod model;
pub mod parser;

pub use error::{ConfigError, Result};
pub use graph::{DependencyGraph, find_cycle, toposort};
pub use model::*;
pub use parser::{parse_kdl_file, parse_kdl_string};
