//! ユーザー設定 (~/.config/stackflow/settings.yaml)
//!
//! ```yaml
//! concurrency: 8
//! state_dir: .stackflow
//! retry:
//!   max_attempts: 5
//!   initial_delay_ms: 500
//! ```
//!
//! 優先順位: CLIフラグ > 環境変数 > settings.yaml > デフォルト

use crate::error::{Result, SettingsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.yaml";

/// プロバイダー呼び出しのリトライ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 同時に実行するステップ数の上限
    pub concurrency: usize,

    pub retry: RetrySettings,

    /// 状態ファイルの保存先（スタックファイルからの相対パス可）
    pub state_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetrySettings::default(),
            state_dir: PathBuf::from(".stackflow"),
        }
    }
}

impl Settings {
    /// グローバル設定ファイルのパス
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("stackflow").join(SETTINGS_FILE))
    }

    /// グローバル設定を読み込み、環境変数で上書き
    ///
    /// ファイルが無ければデフォルト値を使います。
    pub fn load() -> Result<Self> {
        let settings = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        settings.with_env_overrides()
    }

    /// 指定したYAMLファイルを読み込む
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings =
            serde_yaml::from_str(&content).map_err(|e| SettingsError::InvalidSettingsFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        settings.validate()
    }

    /// STACKFLOW_CONCURRENCY / STACKFLOW_STATE_DIR を反映
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("STACKFLOW_CONCURRENCY") {
            self.concurrency = value.parse().map_err(|_| SettingsError::InvalidValue {
                key: "STACKFLOW_CONCURRENCY".to_string(),
                value: value.clone(),
                message: "正の整数を指定してください".to_string(),
            })?;
        }
        if let Ok(value) = std::env::var("STACKFLOW_STATE_DIR") {
            if !value.is_empty() {
                self.state_dir = PathBuf::from(value);
            }
        }
        self.validate()
    }

    fn validate(self) -> Result<Self> {
        if self.concurrency == 0 {
            return Err(SettingsError::InvalidValue {
                key: "concurrency".to_string(),
                value: "0".to_string(),
                message: "1以上を指定してください".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                value: "0".to_string(),
                message: "1以上を指定してください".to_string(),
            });
        }
        Ok(self)
    }
}
