//! モデル定義
//!
//! StackFlowで使用されるデータモデルを定義します。
//! 各モデルは機能ごとにモジュールに分離されています。

mod descriptor;
mod kind;
mod value;

// Re-exports
pub use descriptor::*;
pub use kind::*;
pub use value::*;
