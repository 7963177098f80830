use crate::context::{self, Context};
use crate::printer;
use crate::{EXIT_OK, EXIT_PARTIAL};
use colored::Colorize;
use stackflow_engine::{Cancellation, Executor, FileStateStore, Plan, StateStore};
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn handle(ctx: &Context, yes: bool) -> anyhow::Result<u8> {
    println!("{}", "計画を適用します...".blue().bold());
    ctx.print_stack_file();

    let (deployment, graph) = ctx.load_graph()?;
    println!(
        "デプロイメント: {} ({}個のリソース)",
        deployment.name.cyan(),
        graph.len()
    );

    let store = ctx.store();
    let lock = store.acquire_lock().await?;

    let snapshot = store.load().await?;
    let plan = stackflow_engine::plan(&graph, &snapshot)?;

    if !plan.has_changes {
        printer::print_no_changes();
        lock.release().await?;
        return Ok(EXIT_OK);
    }

    printer::print_plan(&plan);

    if !yes && !context::confirm("この計画を適用しますか？")? {
        println!("{}", "キャンセルしました。".yellow());
        lock.release().await?;
        return Ok(EXIT_OK);
    }

    let code = execute(ctx, store.clone(), &plan).await?;
    lock.release().await?;
    Ok(code)
}

/// 計画を実行し、結果を表示して終了コードを返す
///
/// Ctrl-C で実行中のステップの完了を待ってから中断します。
pub async fn execute(
    ctx: &Context,
    store: Arc<FileStateStore>,
    plan: &Plan,
) -> anyhow::Result<u8> {
    println!();
    println!(
        "{}",
        format!("{}ステップを実行中...", plan.steps.len()).bold()
    );

    let cancellation = Cancellation::new();
    let token = cancellation.token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "中断要求を受け付けました。実行中のステップの完了を待っています...".yellow()
            );
            cancellation.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = printer::spawn_progress(rx);

    let result = {
        let executor = Executor::new(ctx.provider(), store)
            .with_options(ctx.executor_options())
            .with_events(tx);
        executor.apply(plan, token).await
    };

    // executorがドロップされたので進捗表示は残りを出して終わる
    let _ = progress.await;
    interrupt.abort();

    let report = result?;
    printer::print_report(&report);

    if report.is_success() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_PARTIAL)
    }
}
