use crate::context::Context;
use crate::EXIT_OK;
use colored::Colorize;
use stackflow_engine::StateStore;

pub async fn handle_list(ctx: &Context) -> anyhow::Result<u8> {
    let snapshot = ctx.store().load().await?;

    println!(
        "状態ディレクトリ: {}",
        ctx.state_dir.display().to_string().cyan()
    );

    if snapshot.is_empty() {
        println!("{}", "記録済みのリソースはありません。".dimmed());
        return Ok(EXIT_OK);
    }

    for stack in snapshot.stacks() {
        println!();
        println!("{}", format!("stack \"{}\"", stack).bold());
        for record in snapshot.iter().filter(|r| r.address.stack == stack) {
            println!(
                "  {} ({}) handle={} rev={} {}",
                record.address.to_string().cyan(),
                record.kind,
                record.handle,
                record.revision,
                record
                    .updated_at
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
                    .dimmed()
            );
            if record.config_hash.is_empty() {
                println!("    {}", "出力の取得に失敗しています（次回 apply で更新）".yellow());
            }
        }
    }

    println!();
    println!("合計: {}個", snapshot.len());
    Ok(EXIT_OK)
}
