mod commands;
mod context;
mod printer;

use clap::{Parser, Subcommand};
use colored::Colorize;
use context::Context;
use std::path::PathBuf;
use std::process::ExitCode;

/// 正常終了
pub const EXIT_OK: u8 = 0;
/// 一部のステップが失敗・スキップされた
pub const EXIT_PARTIAL: u8 = 1;
/// 設定エラーなど、実行前の致命的なエラー
pub const EXIT_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "stack")]
#[command(about = "宣言したとおりに、依存順で、何度でも。", long_about = None)]
struct Cli {
    /// スタックファイル（省略時は stack.kdl を自動検出）
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// 状態ファイルの保存先
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// 同時に実行するステップ数の上限
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 実行計画を表示（状態は変更しません）
    Plan {
        /// 全リソース削除の計画を表示
        #[arg(long)]
        destroy: bool,
    },
    /// 計画を適用
    Apply {
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// リソースを削除（依存されている順の逆で）
    Destroy {
        /// 対象スタック（下流のスタックも削除されます）
        #[arg(short, long)]
        stack: Option<String>,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 設定を検証
    Validate,
    /// 記録済みの状態を操作
    #[command(subcommand)]
    State(StateCommands),
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
enum StateCommands {
    /// 記録済みのリソース一覧を表示
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ユーザー向けの出力はstdout、ログはstderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("stackflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(EXIT_OK);
    }

    let ctx = Context::resolve(cli.file, cli.state_dir, cli.concurrency)?;

    match cli.command {
        Commands::Plan { destroy } => commands::plan::handle(&ctx, destroy).await,
        Commands::Apply { yes } => commands::apply::handle(&ctx, yes).await,
        Commands::Destroy { stack, yes } => {
            commands::destroy::handle(&ctx, stack.as_deref(), yes).await
        }
        Commands::Validate => commands::validate::handle(&ctx),
        Commands::State(StateCommands::List) => commands::state::handle_list(&ctx).await,
        Commands::Version => Ok(EXIT_OK),
    }
}
