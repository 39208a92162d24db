//! IAOP 演示入口：加载配置、初始化日志、构建平台，执行一个任务并以 JSON 输出结果。
//!
//! 用法：`iaop [任务描述]`

use anyhow::Context;
use iaop::core::{create_platform_builder, TaskRequest};
use serde_json::json;

const DEFAULT_TASK: &str = "生成上月销售额统计";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    iaop::observability::init("info").context("Failed to install tracing subscriber")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let description = if args.is_empty() {
        DEFAULT_TASK.to_string()
    } else {
        args.join(" ")
    };

    let platform = create_platform_builder(None).build();
    let coordinator = platform.coordinator.clone();
    coordinator.start();

    let request = TaskRequest::new(description)
        .with_user("demo")
        .with_context("placeholder_text", json!("{{statistic: 上月销售额}}"))
        .with_context(
            "data_source_context",
            json!({
                "id": "demo-sales-db",
                "name": "sales_warehouse",
                "tables": ["sales"],
            }),
        );
    let outcome = coordinator.execute_task(request).await;
    coordinator.stop();

    let rendered = serde_json::to_string_pretty(&outcome).context("Failed to serialize task outcome")?;
    println!("{rendered}");
    if !outcome.success {
        anyhow::bail!(
            "task {} failed: {}",
            outcome.task_id,
            outcome.error.unwrap_or_default()
        );
    }
    Ok(())
}
