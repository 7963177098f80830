use crate::context::Context;
use crate::printer;
use crate::EXIT_OK;
use colored::Colorize;
use stackflow_engine::StateStore;

pub async fn handle(ctx: &Context, destroy: bool) -> anyhow::Result<u8> {
    println!("{}", "実行計画を作成中...".blue());

    let snapshot = ctx.store().load().await?;

    let plan = if destroy {
        stackflow_engine::plan_destroy(&snapshot, |_| true)?
    } else {
        ctx.print_stack_file();
        let (deployment, graph) = ctx.load_graph()?;
        println!(
            "デプロイメント: {} ({}個のリソース)",
            deployment.name.cyan(),
            graph.len()
        );
        stackflow_engine::plan(&graph, &snapshot)?
    };

    if !plan.has_changes {
        printer::print_no_changes();
        return Ok(EXIT_OK);
    }

    printer::print_plan(&plan);
    Ok(EXIT_OK)
}
