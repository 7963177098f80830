use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("未知のリソース種別です: '{0}'")]
    UnknownResourceKind(String),

    #[error("循環依存が検出されました: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("参照を解決できません: {reference}\n理由: {message}")]
    UnresolvedReference { reference: String, message: String },

    #[error("宣言されていない依存関係です: {from} -> {to}\n理由: {message}")]
    UndeclaredDependency {
        from: String,
        to: String,
        message: String,
    },

    #[error("リソースが重複しています: {0}")]
    DuplicateResource(String),

    #[error("スタックが見つかりません: {0}")]
    UnknownStack(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
