use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: stack.kdl, stack.local.kdl, .stack.kdl, .stack.local.kdl\n\
        - ./.stackflow/ ディレクトリ\n\
        - ~/.config/stackflow/stack.kdl\n\
        または STACKFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    StackFileNotFound,

    #[error("設定ファイルを読み込めません: {path}\n理由: {message}")]
    InvalidSettingsFile { path: PathBuf, message: String },

    #[error("無効な設定値 {key}={value}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
