use crate::context::Context;
use crate::{EXIT_FATAL, EXIT_OK};
use colored::Colorize;

pub fn handle(ctx: &Context) -> anyhow::Result<u8> {
    println!("{}", "設定を検証中...".blue());

    let path = ctx.stack_file()?;
    println!("スタックファイル: {}", path.display().to_string().cyan());

    let (deployment, graph) = match ctx.load_graph() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ 設定エラー".red().bold());
            eprintln!("  {:#}", e);
            return Ok(EXIT_FATAL);
        }
    };

    println!("{}", "✓ 設定ファイルは正常です！".green().bold());
    println!();
    println!("サマリー:");
    println!("  デプロイメント: {}", deployment.name.cyan());
    println!("  スタック: {}個", deployment.stacks.len());
    for stack in &deployment.stacks {
        let upstream = if stack.depends_on.is_empty() {
            String::new()
        } else {
            format!(
                ", depends-on: {}",
                stack
                    .depends_on
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!(
            "    - {} ({}個のリソース{})",
            stack.id.cyan(),
            stack.resources.len(),
            upstream
        );
    }

    println!("  適用順序:");
    for (i, address) in graph.topological_order().iter().enumerate() {
        let kind = graph
            .descriptor(address)
            .map(|d| d.kind().to_string())
            .unwrap_or_default();
        println!("    {:>2}. {} ({})", i + 1, address.to_string().cyan(), kind);
    }

    Ok(EXIT_OK)
}
