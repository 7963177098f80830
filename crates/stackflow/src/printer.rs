use colored::{ColoredString, Colorize};
use stackflow_engine::{Action, ApplyEvent, ApplyReport, Plan, StepStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn action_marker(action: Action) -> ColoredString {
    let symbol = format!("{:>3}", action.symbol());
    match action {
        Action::Create => symbol.green().bold(),
        Action::Update => symbol.yellow().bold(),
        Action::Replace => symbol.magenta().bold(),
        Action::Destroy => symbol.red().bold(),
        Action::NoOp => symbol.normal(),
    }
}

/// 計画の内容を表示（変更のないリソースは省略）
///
/// 依存関係の記録だけを書き換えるリソースは表示します。
pub fn print_plan(plan: &Plan) {
    println!();
    println!("{}", "実行計画:".bold());

    let shown = plan
        .changes
        .iter()
        .filter(|c| c.action != Action::NoOp || c.refresh_dependencies);
    for change in shown {
        println!(
            "  {} {} ({})",
            action_marker(change.action),
            change.address.to_string().cyan(),
            change.kind
        );
        if !change.changed_fields.is_empty() {
            println!(
                "        {} {}",
                "変更:".dimmed(),
                change.changed_fields.join(", ")
            );
        }
        println!("        {} {}", "理由:".dimmed(), change.reason.dimmed());
    }

    println!();
    println!("{} {}", "Plan:".bold(), plan.summary());
}

pub fn print_no_changes() {
    println!();
    println!(
        "{}",
        "✓ 変更はありません。リソースは宣言どおりです。".green()
    );
}

/// 実行中のイベントを表示するタスクを起動
///
/// 送信側がすべてドロップされると終了します。
pub fn spawn_progress(mut events: mpsc::UnboundedReceiver<ApplyEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ApplyEvent::Started { address, op } => {
                    println!("  {} {} {}", "▶".blue(), op, address.to_string().cyan());
                }
                ApplyEvent::Retrying {
                    address,
                    op,
                    attempt,
                    delay,
                    error,
                } => {
                    println!(
                        "  {} {} {} リトライ {}回目 ({}ms後): {}",
                        "↻".yellow(),
                        op,
                        address,
                        attempt,
                        delay.as_millis(),
                        error.dimmed()
                    );
                }
                ApplyEvent::Finished(outcome) => match outcome.status {
                    StepStatus::Succeeded => println!(
                        "  {} {} {}",
                        "✓".green(),
                        outcome.op,
                        outcome.address.to_string().cyan()
                    ),
                    StepStatus::Failed => println!(
                        "  {} {} {}: {}",
                        "✗".red(),
                        outcome.op,
                        outcome.address,
                        outcome.error.as_deref().unwrap_or("unknown error").red()
                    ),
                    StepStatus::Skipped => println!(
                        "  {} {} {} ({})",
                        "-".dimmed(),
                        outcome.op,
                        outcome.address,
                        outcome.message.dimmed()
                    ),
                    StepStatus::Pending | StepStatus::InProgress => {}
                },
            }
        }
    })
}

pub fn print_report(report: &ApplyReport) {
    println!();
    if report.is_success() {
        println!("{} {}", "✓ 完了:".green().bold(), report);
        return;
    }

    if report.cancelled {
        println!("{} {}", "⚠ 中断されました:".yellow().bold(), report);
    } else {
        println!("{} {}", "✗ 一部失敗:".red().bold(), report);
    }

    let failed = report.failed();
    if !failed.is_empty() {
        println!("{}", "失敗したステップ:".bold());
        for outcome in failed {
            println!(
                "  • {} {}: {}",
                outcome.op,
                outcome.address.to_string().cyan(),
                outcome.error.as_deref().unwrap_or("")
            );
        }
    }

    let skipped = report.skipped();
    if !skipped.is_empty() {
        println!("{}", "スキップしたステップ:".bold());
        for outcome in skipped {
            println!(
                "  • {} {} ({})",
                outcome.op,
                outcome.address.to_string().cyan(),
                outcome.message
            );
        }
    }

    println!();
    println!(
        "{}",
        "完了したステップは記録済みです。再度 apply すると残りを再開します。".yellow()
    );
}
