use crate::commands::apply;
use crate::context::{self, Context};
use crate::printer;
use crate::EXIT_OK;
use colored::Colorize;
use stackflow_core::ConfigError;
use stackflow_engine::StateStore;
use std::collections::BTreeSet;

pub async fn handle(ctx: &Context, stack: Option<&str>, yes: bool) -> anyhow::Result<u8> {
    println!("{}", "リソースを削除します...".red().bold());
    ctx.print_stack_file();

    let store = ctx.store();
    let lock = store.acquire_lock().await?;
    let snapshot = store.load().await?;

    let plan = match stack {
        None => stackflow_engine::plan_destroy(&snapshot, |_| true)?,
        Some(stack) => {
            let mut targets: BTreeSet<String> = BTreeSet::from([stack.to_string()]);
            let mut known = snapshot.stacks().contains(stack);

            // 宣言があれば下流のスタックもまとめて対象にする
            if ctx.has_stack_file() {
                let (deployment, graph) = ctx.load_graph()?;
                known |= deployment.stack(stack).is_some();
                targets.extend(graph.downstream_stacks(stack));
            }
            if !known {
                return Err(ConfigError::UnknownStack(stack.to_string()).into());
            }

            println!(
                "対象スタック: {}",
                targets
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
                    .cyan()
            );
            stackflow_engine::plan_destroy(&snapshot, |record| {
                targets.contains(&record.address.stack)
            })?
        }
    };

    if !plan.has_changes {
        println!();
        println!("{}", "削除するリソースはありません。".green());
        lock.release().await?;
        return Ok(EXIT_OK);
    }

    printer::print_plan(&plan);

    if !yes {
        println!();
        println!(
            "{}",
            "⚠ 警告: 上記のリソースを削除します。この操作は元に戻せません。"
                .red()
                .bold()
        );
        if !context::confirm("削除しますか？")? {
            println!("{}", "キャンセルしました。".yellow());
            lock.release().await?;
            return Ok(EXIT_OK);
        }
    }

    let code = apply::execute(ctx, store.clone(), &plan).await?;
    lock.release().await?;
    Ok(code)
}
