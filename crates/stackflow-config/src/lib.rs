pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{RetrySettings, Settings};

use std::path::{Path, PathBuf};

const CANDIDATES: [&str; 4] = [
    "stack.local.kdl",
    ".stack.local.kdl",
    "stack.kdl",
    ".stack.kdl",
];

/// StackFlowの設定ディレクトリ (~/.config/stackflow) を取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(SettingsError::ConfigDirNotFound)?
        .join("stackflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// プロジェクトのstack.kdlファイルを探す
///
/// 環境変数 STACKFLOW_CONFIG_PATH が指す既存のファイルを最優先し、
/// 次に [`search_paths`] の順で最初に存在するファイルを返します。
pub fn find_stack_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("STACKFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "STACKFLOW_CONFIG_PATH={} が存在しないため無視します",
            path.display()
        );
    }

    let current_dir = std::env::current_dir()?;
    let found = search_paths(&current_dir).into_iter().find(|p| p.is_file());
    match found {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Found stack file");
            Ok(path)
        }
        None => Err(SettingsError::StackFileNotFound),
    }
}

/// スタックファイルの検索候補（優先順）
///
/// `start` から親ディレクトリへ順にさかのぼり、各ディレクトリで
/// 直下の候補、`.stackflow/` 内の候補の順に並べます。
/// 最後に ~/.config/stackflow/stack.kdl が続きます。
pub fn search_paths(start: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = start
        .ancestors()
        .flat_map(|dir| {
            let local_dir = dir.join(".stackflow");
            CANDIDATES
                .iter()
                .map(move |name| dir.join(name))
                .chain(CANDIDATES.iter().map(move |name| local_dir.join(name)))
        })
        .collect();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("stackflow").join("stack.kdl"));
    }
    paths
}
