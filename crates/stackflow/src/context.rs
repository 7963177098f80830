use anyhow::Context as _;
use colored::Colorize;
use stackflow_config::{Settings, SettingsError};
use stackflow_core::{DependencyGraph, Deployment};
use stackflow_engine::{ExecutorOptions, FileStateStore, RetryConfig};
use stackflow_provider_local::LocalProvider;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// コマンド実行に必要な設定をまとめたもの
///
/// 優先順位: CLIフラグ > 環境変数 > settings.yaml > デフォルト
pub struct Context {
    stack_file: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub settings: Settings,
}

impl Context {
    pub fn resolve(
        file: Option<PathBuf>,
        state_dir: Option<PathBuf>,
        concurrency: Option<usize>,
    ) -> anyhow::Result<Self> {
        let mut settings = Settings::load()?;
        if let Some(concurrency) = concurrency {
            if concurrency == 0 {
                anyhow::bail!("--concurrency には1以上を指定してください");
            }
            settings.concurrency = concurrency;
        }

        let stack_file = match file {
            Some(path) => Some(path),
            None => match stackflow_config::find_stack_file() {
                Ok(path) => Some(path),
                // destroy / state list は状態だけで動ける
                Err(SettingsError::StackFileNotFound) => None,
                Err(e) => return Err(e.into()),
            },
        };

        // 相対パスはスタックファイルの場所を基準にする
        let state_dir = state_dir.unwrap_or_else(|| settings.state_dir.clone());
        let state_dir = if state_dir.is_absolute() {
            state_dir
        } else {
            let base = stack_file
                .as_deref()
                .and_then(Path::parent)
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or(std::env::current_dir()?);
            base.join(state_dir)
        };

        tracing::debug!(
            stack_file = ?stack_file,
            state_dir = %state_dir.display(),
            concurrency = settings.concurrency,
            "Resolved context"
        );

        Ok(Self {
            stack_file,
            state_dir,
            settings,
        })
    }

    pub fn stack_file(&self) -> anyhow::Result<&Path> {
        self.stack_file
            .as_deref()
            .ok_or_else(|| SettingsError::StackFileNotFound.into())
    }

    pub fn has_stack_file(&self) -> bool {
        self.stack_file.is_some()
    }

    /// スタックファイルを読み込み、依存グラフを構築
    pub fn load_graph(&self) -> anyhow::Result<(Deployment, DependencyGraph)> {
        let path = self.stack_file()?;
        let deployment = stackflow_core::parse_kdl_file(path)
            .with_context(|| format!("{} を読み込めません", path.display()))?;
        let graph = DependencyGraph::build(&deployment)?;
        Ok((deployment, graph))
    }

    pub fn print_stack_file(&self) {
        if let Some(path) = &self.stack_file {
            println!("スタックファイル: {}", path.display().to_string().cyan());
        }
    }

    pub fn store(&self) -> Arc<FileStateStore> {
        Arc::new(FileStateStore::new(&self.state_dir))
    }

    pub fn provider(&self) -> Arc<LocalProvider> {
        Arc::new(LocalProvider::new(&self.state_dir))
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        let retry = &self.settings.retry;
        ExecutorOptions {
            concurrency: self.settings.concurrency,
            retry: RetryConfig {
                max_attempts: retry.max_attempts,
                initial_delay: retry.initial_delay(),
                max_delay: retry.max_delay(),
                backoff_multiplier: retry.backoff_multiplier,
            },
        }
    }
}

/// [y/N] で確認（入力が無ければ No）
pub fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{} [y/N]: ", question.bold());
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
