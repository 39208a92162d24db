//! 工具执行器
//!
//! 一批请求中每个工具在独立 tokio 任务中运行：超时、返回 Err、panic 都只会让该工具记为失败，
//! 不影响同批其他工具。批次在取消或被丢弃时中止仍在运行的工具任务。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{IaopError, TaskScheduler};
use crate::tools::{Tool, ToolKind, ToolRegistry, ToolRequest};

/// 单个工具的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool: ToolKind,
    pub input: Value,
    pub output: Value,
    pub success: bool,
    /// 秒
    pub execution_time: f64,
    pub tool_index: usize,
    pub task_completion_signal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecution {
    fn failure(tool: ToolKind, input: Value, index: usize, elapsed: Duration, error: String) -> Self {
        Self {
            tool,
            input,
            output: Value::Null,
            success: false,
            execution_time: elapsed.as_secs_f64(),
            tool_index: index,
            task_completion_signal: false,
            error: Some(error),
        }
    }
}

/// 一批工具的聚合结果（executions 按 tool_index 有序）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub executions: Vec<ToolExecution>,
    pub success_count: usize,
    pub total_count: usize,
}

impl BatchOutcome {
    pub fn successful(&self) -> impl Iterator<Item = &ToolExecution> {
        self.executions.iter().filter(|e| e.success)
    }
}

/// 持有工具任务句柄，drop 时中止全部（已结束的任务 abort 无副作用）
struct AbortOnDrop(Vec<JoinHandle<ToolExecution>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// 工具执行器
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    scheduler: Arc<TaskScheduler>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, scheduler: Arc<TaskScheduler>, timeout_secs: u64) -> Self {
        Self {
            registry,
            scheduler,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 并发执行一批请求；仅在取消时返回 Err(Cancelled)，单个工具的失败体现在对应 ToolExecution 中
    pub async fn execute_batch(
        &self,
        requests: Vec<ToolRequest>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, IaopError> {
        let mut handles = Vec::with_capacity(requests.len());
        for (index, req) in requests.iter().enumerate() {
            let tool = self.registry.get(req.tool);
            let scheduler = Arc::clone(&self.scheduler);
            let kind = req.tool;
            let input = req.input.clone();
            let limit = self.timeout;
            handles.push(tokio::spawn(async move {
                run_one(tool, kind, input, index, scheduler, limit).await
            }));
        }

        let mut guard = AbortOnDrop(handles);
        let started = Instant::now();
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(tools = requests.len(), "tool batch cancelled");
                return Err(IaopError::Cancelled);
            }
            results = join_all(guard.0.iter_mut()) => results,
        };

        let executions: Vec<ToolExecution> = joined
            .into_iter()
            .zip(requests)
            .enumerate()
            .map(|(index, (joined, req))| match joined {
                Ok(exec) => exec,
                Err(e) => {
                    let reason = if e.is_panic() {
                        "tool task panicked".to_string()
                    } else {
                        format!("tool task aborted: {e}")
                    };
                    audit(req.tool, false, "panic", started.elapsed(), &req.input);
                    ToolExecution::failure(req.tool, req.input, index, started.elapsed(), reason)
                }
            })
            .collect();

        let success_count = executions.iter().filter(|e| e.success).count();
        let total_count = executions.len();
        Ok(BatchOutcome {
            executions,
            success_count,
            total_count,
        })
    }
}

async fn run_one(
    tool: Option<Arc<dyn Tool>>,
    kind: ToolKind,
    input: Value,
    index: usize,
    scheduler: Arc<TaskScheduler>,
    limit: Duration,
) -> ToolExecution {
    let start = Instant::now();
    let result = match tool {
        None => Err(IaopError::UnknownTool(kind.to_string())),
        Some(tool) => match scheduler.acquire_tool().await {
            Err(e) => Err(e),
            Ok(_permit) => match timeout(limit, tool.execute(&input)).await {
                Ok(r) => r,
                Err(_) => Err(IaopError::ToolTimeout(kind.to_string())),
            },
        },
    };

    let elapsed = start.elapsed();
    let outcome = match &result {
        Ok(r) if r.success => "ok",
        Ok(_) => "failed",
        Err(IaopError::ToolTimeout(_)) => "timeout",
        Err(_) => "error",
    };
    audit(kind, outcome == "ok", outcome, elapsed, &input);

    match result {
        Ok(r) => ToolExecution {
            tool: kind,
            input,
            output: r.output,
            success: r.success,
            execution_time: elapsed.as_secs_f64(),
            tool_index: index,
            task_completion_signal: r.completion_signal,
            error: r.error,
        },
        Err(e) => ToolExecution::failure(kind, input, index, elapsed, e.to_string()),
    }
}

fn audit(kind: ToolKind, ok: bool, outcome: &str, elapsed: Duration, input: &Value) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": kind.as_str(),
        "ok": ok,
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(input),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo(ToolKind);

    #[async_trait]
    impl Tool for Echo {
        fn kind(&self) -> ToolKind {
            self.0
        }
        fn description(&self) -> &str {
            "echo"
        }
        async fn execute(&self, input: &Value) -> Result<ToolResult, IaopError> {
            Ok(ToolResult::ok(input.clone()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Tool for Panics {
        fn kind(&self) -> ToolKind {
            ToolKind::DataAnalysis
        }
        fn description(&self) -> &str {
            "panics"
        }
        async fn execute(&self, _input: &Value) -> Result<ToolResult, IaopError> {
            panic!("boom")
        }
    }

    struct Sleeps;

    #[async_trait]
    impl Tool for Sleeps {
        fn kind(&self) -> ToolKind {
            ToolKind::ReportGeneration
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _input: &Value) -> Result<ToolResult, IaopError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolResult::ok(Value::Null))
        }
    }

    fn executor(timeout_secs: u64) -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register_tool(Echo(ToolKind::SqlGeneration));
        reg.register_tool(Echo(ToolKind::PlaceholderAnalysis));
        reg.register_tool(Panics);
        reg.register_tool(Sleeps);
        ToolExecutor::new(Arc::new(reg), Arc::new(TaskScheduler::new(4)), timeout_secs)
    }

    #[tokio::test]
    async fn test_panicking_tool_is_isolated() {
        let exec = executor(5);
        let reqs = vec![
            ToolRequest::new(ToolKind::SqlGeneration, json!({"n": 1})),
            ToolRequest::new(ToolKind::DataAnalysis, json!({"n": 2})),
            ToolRequest::new(ToolKind::PlaceholderAnalysis, json!({"n": 3})),
        ];
        let out = exec.execute_batch(reqs, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.total_count, 3);
        assert_eq!(out.success_count, 2);
        assert!(out.executions[0].success);
        assert!(!out.executions[1].success);
        assert_eq!(out.executions[1].tool_index, 1);
        assert!(out.executions[2].success);
        assert_eq!(out.executions[2].output, json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_without_aborting_batch() {
        let exec = executor(5);
        let reqs = vec![
            ToolRequest::new(ToolKind::GeneralProcessing, json!({})),
            ToolRequest::new(ToolKind::SqlGeneration, json!({})),
        ];
        let out = exec.execute_batch(reqs, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.success_count, 1);
        assert!(out.executions[0]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_timeout_marks_tool_failed() {
        let exec = executor(1);
        let reqs = vec![ToolRequest::new(ToolKind::ReportGeneration, json!({}))];
        let out = exec.execute_batch(reqs, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.success_count, 0);
        assert!(out.executions[0].error.as_deref().unwrap_or_default().contains("timeout"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_batch() {
        let exec = executor(60);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reqs = vec![ToolRequest::new(ToolKind::ReportGeneration, json!({}))];
        let err = exec.execute_batch(reqs, &cancel).await.unwrap_err();
        assert!(matches!(err, IaopError::Cancelled));
    }
}
