//! TT 控制器：六阶段、可递归、流式的主控循环
//!
//! 递归不使用语言级调用，而是显式的帧栈：需要递归时压入子帧，子帧结束后父帧发出 recursion_complete 并结束，
//! 因而事件流是深度优先、因果有序的。每个帧边界检查取消。
//!
//! 单帧流程：Enter → 阶段 1..3 → 阶段 4（选策略、组工具请求）→
//!   有工具：并发执行 → 有工具宣告完成则直接 task_complete（跳过 5、6），否则把结果并入上下文并递归；
//!   无工具：阶段 5、6 → task_complete。

use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::IaopError;
use crate::memory::{compact_history, Message};
use crate::tools::{SpecializedAgentType, ToolExecution, ToolExecutor, ToolInput, ToolKind, ToolRequest};
use crate::tt::events::{TtEvent, TtEventKind};
use crate::tt::heuristics::{ImplementationStrategy, StrategySelector};
use crate::tt::stages::{relevant_subset, StageEngine, StageStep};
use crate::tt::state::{FramePhase, LoopFrame, Stage, TtContext, TtLoopState};

pub type TtEventStream = Pin<Box<dyn Stream<Item = TtEvent> + Send>>;

const TOTAL_STAGES: usize = 6;

fn emit(kind: TtEventKind, data: Value, frame: &LoopFrame) -> TtEvent {
    TtEvent::new(kind, data, &frame.loop_state.turn_id, frame.loop_state.turn_counter)
}

fn system_error(frame: &LoopFrame, err: &IaopError) -> TtEvent {
    let mut data = json!({
        "error_kind": err.kind(),
        "error": err.to_string(),
        "task_id": frame.context.task_id,
        "turn_counter": frame.loop_state.turn_counter,
    });
    if let IaopError::RecursionLimitExceeded { max_depth, .. } = err {
        data["max_recursion_depth"] = json!(max_depth);
    }
    emit(TtEventKind::SystemError, data, frame)
}

/// 合并宣告完成的工具输出：单个工具直接取其输出
fn merge_outputs(execs: &[&ToolExecution]) -> Value {
    if let [only] = execs {
        return only.output.clone();
    }
    let mut merged = Map::new();
    for exec in execs {
        if let Value::Object(obj) = &exec.output {
            for (k, v) in obj {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    let per_tool: Vec<Value> = execs
        .iter()
        .map(|e| json!({"tool": e.tool, "output": e.output}))
        .collect();
    merged.insert("tool_outputs".into(), Value::Array(per_tool));
    Value::Object(merged)
}

pub struct TtController {
    stages: StageEngine,
    selector: Arc<dyn StrategySelector>,
    executor: Arc<ToolExecutor>,
    compact_keep: usize,
}

impl TtController {
    pub fn new(
        stages: StageEngine,
        selector: Arc<dyn StrategySelector>,
        executor: Arc<ToolExecutor>,
        compact_keep: usize,
    ) -> Self {
        Self {
            stages,
            selector,
            executor,
            compact_keep,
        }
    }

    pub fn stages(&self) -> &StageEngine {
        &self.stages
    }

    /// 内存压力下压缩消息历史，返回事件负载
    fn maybe_compact(&self, frame: &mut LoopFrame) -> Option<Value> {
        let before = frame.context.estimated_bytes();
        if before <= frame.loop_state.memory_threshold {
            return None;
        }
        let summarized = compact_history(&mut frame.context.message_history, self.compact_keep)?;
        frame.loop_state.compacted = true;
        let after = frame.context.estimated_bytes();
        tracing::info!(
            task_id = %frame.context.task_id,
            summarized,
            bytes_before = before,
            bytes_after = after,
            "message history compacted"
        );
        Some(json!({
            "summarized_messages": summarized,
            "remaining_messages": frame.context.message_history.len(),
            "estimated_bytes_before": before,
            "estimated_bytes_after": after,
        }))
    }

    /// 只为已注册的工具生成请求；末位工具标记为 terminal
    fn build_tool_requests(&self, ctx: &TtContext, strategy: &ImplementationStrategy) -> Vec<ToolRequest> {
        let registry = self.executor.registry();
        let order: Vec<ToolKind> = strategy
            .execution_order
            .iter()
            .copied()
            .filter(|k| registry.contains(*k))
            .collect();
        let subset = relevant_subset(ctx, strategy);
        let previous = ctx.context_data.get("tool_results").cloned().unwrap_or(Value::Null);
        let last = order.len().saturating_sub(1);
        order
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let agent_type = if order.len() == 1 {
                    strategy.agent_type
                } else {
                    SpecializedAgentType::GeneralAssistant
                };
                let input = ToolInput {
                    task: ctx.task_description.clone(),
                    context: subset.clone(),
                    agent_type,
                    prompt_adaptation: strategy.prompt_adaptation.clone(),
                    strategy: strategy.name.clone(),
                    terminal: i == last,
                    previous_results: previous.clone(),
                };
                ToolRequest::new(*kind, input.to_value())
            })
            .collect()
    }

    /// 启动一次 TT 调用；返回惰性事件流，轮询前不做任何工作
    pub fn tt(
        self: &Arc<Self>,
        context: TtContext,
        loop_state: TtLoopState,
        cancel: CancellationToken,
    ) -> TtEventStream {
        let this = Arc::clone(self);
        Box::pin(async_stream::stream! {
            let mut stack: Vec<LoopFrame> = vec![LoopFrame::new(context, loop_state)];
            // 最近一个终止事件是否成功；子帧结束后由父帧读取
            let mut last_success = false;

            while !stack.is_empty() {
                let top = stack.len() - 1;

                if cancel.is_cancelled() {
                    let frame = &stack[top];
                    tracing::warn!(task_id = %frame.context.task_id, turn = frame.loop_state.turn_counter, "tt loop cancelled");
                    yield emit(TtEventKind::Cancelled, json!({"task_id": frame.context.task_id}), frame);
                    yield system_error(frame, &IaopError::Cancelled);
                    return;
                }

                let phase = stack[top].phase.clone();
                match phase {
                    FramePhase::Enter => {
                        let frame = &mut stack[top];
                        if frame.loop_state.limit_reached() {
                            let err = IaopError::RecursionLimitExceeded {
                                turn: frame.loop_state.turn_counter,
                                max_depth: frame.loop_state.max_recursion_depth,
                            };
                            tracing::error!(task_id = %frame.context.task_id, error = %err, "recursion limit reached");
                            last_success = false;
                            yield system_error(frame, &err);
                            frame.phase = FramePhase::Finished;
                            continue;
                        }
                        tracing::debug!(task_id = %frame.context.task_id, turn = frame.loop_state.turn_counter, "turn start");
                        yield emit(TtEventKind::TurnStart, json!({
                            "task_id": frame.context.task_id,
                            "task_description": frame.context.task_description,
                            "is_resuming": frame.loop_state.is_resuming,
                            "max_recursion_depth": frame.loop_state.max_recursion_depth,
                        }), frame);
                        if let Some(data) = this.maybe_compact(frame) {
                            yield emit(TtEventKind::MemoryCompaction, data, frame);
                        }
                        frame.phase = FramePhase::Stage(Stage::IntentUnderstanding);
                    }

                    FramePhase::Stage(Stage::Implementation) => {
                        let frame = &mut stack[top];
                        let stage = Stage::Implementation;
                        yield emit(TtEventKind::StageStart, json!({"stage": stage.as_str(), "stage_index": stage.index()}), frame);
                        yield emit(TtEventKind::UiStateUpdate, json!({
                            "phase": stage.as_str(),
                            "stage_index": stage.index(),
                            "total_stages": TOTAL_STAGES,
                        }), frame);

                        let strategy = this.stages.plan_implementation(this.selector.as_ref(), &frame.context);
                        let requests = this.build_tool_requests(&frame.context, &strategy);
                        let output = json!({
                            "strategy": strategy,
                            "tool_requests": requests,
                            "implementation_result": {
                                "strategy": strategy.name,
                                "confidence": strategy.confidence,
                                "reasoning": strategy.reasoning,
                                "relevant_context": relevant_subset(&frame.context, &strategy),
                            },
                            "fallback": false,
                            "llm_used": false,
                        });
                        frame.context.message_history.push(Message::assistant(format!(
                            "[{}] strategy={} tools={}",
                            stage.as_str(),
                            strategy.name,
                            requests.len()
                        )));
                        frame.outputs.insert(stage, output.clone());
                        yield emit(TtEventKind::StageComplete, json!({
                            "stage": stage.as_str(),
                            "stage_index": stage.index(),
                            "output": output,
                        }), frame);

                        frame.phase = if requests.is_empty() {
                            FramePhase::Stage(Stage::Optimization)
                        } else {
                            FramePhase::DispatchTools
                        };
                        frame.strategy = Some(strategy);
                        frame.pending_tools = requests;
                    }

                    FramePhase::Stage(stage) => {
                        let frame = &mut stack[top];
                        yield emit(TtEventKind::StageStart, json!({"stage": stage.as_str(), "stage_index": stage.index()}), frame);
                        yield emit(TtEventKind::UiStateUpdate, json!({
                            "phase": stage.as_str(),
                            "stage_index": stage.index(),
                            "total_stages": TOTAL_STAGES,
                        }), frame);

                        let mut steps = this.stages.run_llm_stage(stage, &frame.context, &frame.outputs);
                        let mut output = Value::Null;
                        let mut fallback_reason = None;
                        while let Some(step) = steps.next().await {
                            match step {
                                StageStep::Event { kind, data } => yield emit(kind, data, frame),
                                StageStep::Output { value, fallback_reason: reason } => {
                                    output = value;
                                    fallback_reason = reason;
                                }
                            }
                        }
                        if let Some(reason) = fallback_reason {
                            yield emit(TtEventKind::StageFallback, json!({"stage": stage.as_str(), "reason": reason}), frame);
                        }

                        frame.context.message_history.push(Message::assistant(format!("[{}] {}", stage.as_str(), output)));
                        frame.outputs.insert(stage, output.clone());
                        yield emit(TtEventKind::StageComplete, json!({
                            "stage": stage.as_str(),
                            "stage_index": stage.index(),
                            "output": output,
                        }), frame);

                        match stage.next() {
                            Some(next) => frame.phase = FramePhase::Stage(next),
                            None => {
                                let stages: Map<String, Value> = Stage::ALL
                                    .iter()
                                    .filter_map(|s| frame.outputs.get(s).map(|v| (s.as_str().to_string(), v.clone())))
                                    .collect();
                                last_success = true;
                                tracing::info!(task_id = %frame.context.task_id, turn = frame.loop_state.turn_counter, "task complete after synthesis");
                                yield emit(TtEventKind::TaskComplete, json!({
                                    "success": true,
                                    "early_termination": false,
                                    "result": output.get("final_result").cloned().unwrap_or(Value::Null),
                                    "quality": output.get("quality").cloned().unwrap_or(Value::Null),
                                    "confidence": output.get("confidence").cloned().unwrap_or(Value::Null),
                                    "stages": stages,
                                }), frame);
                                frame.phase = FramePhase::Finished;
                            }
                        }
                    }

                    FramePhase::DispatchTools => {
                        let frame = &mut stack[top];
                        let requests = std::mem::take(&mut frame.pending_tools);
                        let start = json!({
                            "tools": requests.iter().map(|r| r.tool.as_str()).collect::<Vec<_>>(),
                            "count": requests.len(),
                        });
                        yield emit(TtEventKind::ToolExecutionStart, start, frame);

                        let batch = match this.executor.execute_batch(requests, &cancel).await {
                            Ok(batch) => batch,
                            // 取消由循环顶部统一处理
                            Err(IaopError::Cancelled) => continue,
                            Err(err) => {
                                last_success = false;
                                yield system_error(frame, &err);
                                frame.phase = FramePhase::Finished;
                                continue;
                            }
                        };

                        for exec in &batch.executions {
                            let data = serde_json::to_value(exec).unwrap_or(Value::Null);
                            if exec.success {
                                yield emit(TtEventKind::ToolResult, data, frame);
                            } else {
                                yield emit(TtEventKind::ToolExecutionError, data, frame);
                            }
                        }
                        let successful: Vec<&ToolExecution> = batch.successful().collect();
                        yield emit(TtEventKind::ToolExecutionComplete, json!({
                            "results": successful,
                            "success_count": batch.success_count,
                            "total_count": batch.total_count,
                        }), frame);

                        let completed_ok: Vec<&ToolExecution> = batch
                            .executions
                            .iter()
                            .filter(|e| e.task_completion_signal && e.success)
                            .collect();
                        let completed_failed: Vec<&ToolExecution> = batch
                            .executions
                            .iter()
                            .filter(|e| e.task_completion_signal && !e.success)
                            .collect();

                        if !completed_ok.is_empty() || !completed_failed.is_empty() {
                            let success = !completed_ok.is_empty();
                            let signalled = if success { &completed_ok } else { &completed_failed };
                            let completed_by: Vec<&str> = signalled.iter().map(|e| e.tool.as_str()).collect();
                            tracing::info!(
                                task_id = %frame.context.task_id,
                                success,
                                completed_by = ?completed_by,
                                "early termination, skipping optimization and synthesis"
                            );
                            yield emit(TtEventKind::EarlyTermination, json!({
                                "success": success,
                                "completed_by": completed_by,
                                "skipped_stages": [Stage::Optimization.as_str(), Stage::Synthesis.as_str()],
                            }), frame);

                            let mut data = json!({
                                "success": success,
                                "early_termination": true,
                                "completed_by": completed_by,
                                "result": merge_outputs(signalled),
                                "strategy": frame.strategy.as_ref().map(|s| s.name.clone()),
                            });
                            if !success {
                                let errors: Vec<&str> = signalled.iter().filter_map(|e| e.error.as_deref()).collect();
                                data["error"] = json!(errors.join("; "));
                            }
                            last_success = success;
                            yield emit(TtEventKind::TaskComplete, data, frame);
                            frame.phase = FramePhase::Finished;
                            continue;
                        }

                        // 无完成信号：结果并入上下文后递归
                        let results = match serde_json::to_value(&batch.executions) {
                            Ok(v) => v,
                            Err(e) => {
                                last_success = false;
                                yield system_error(frame, &IaopError::JsonParse(e.to_string()));
                                frame.phase = FramePhase::Finished;
                                continue;
                            }
                        };
                        frame.context.context_data.insert("tool_results".to_string(), results);
                        frame.context.message_history.push(Message::assistant(format!(
                            "[tools] {}/{} succeeded without completing the task",
                            batch.success_count, batch.total_count
                        )));
                        if let Some(data) = this.maybe_compact(frame) {
                            yield emit(TtEventKind::MemoryCompaction, data, frame);
                        }

                        let child = LoopFrame::new(frame.context.clone(), frame.loop_state.increment_turn());
                        tracing::info!(
                            task_id = %frame.context.task_id,
                            next_turn = child.loop_state.turn_counter,
                            "recursing"
                        );
                        yield emit(TtEventKind::RecursionStart, json!({
                            "next_turn_counter": child.loop_state.turn_counter,
                            "next_turn_id": child.loop_state.turn_id,
                            "success_count": batch.success_count,
                            "total_count": batch.total_count,
                        }), frame);
                        frame.phase = FramePhase::AwaitingChild;
                        stack.push(child);
                    }

                    FramePhase::AwaitingChild => {
                        let frame = &mut stack[top];
                        yield emit(TtEventKind::RecursionComplete, json!({
                            "child_turn_counter": frame.loop_state.turn_counter + 1,
                            "child_success": last_success,
                        }), frame);
                        frame.phase = FramePhase::Finished;
                    }

                    FramePhase::Finished => {
                        stack.pop();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskScheduler;
    use crate::llm::{LlmReasoningTool, MockLlmClient};
    use crate::tools::{Tool, ToolRegistry, ToolResult};
    use crate::tt::heuristics::KeywordStrategySelector;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NeverDone;

    #[async_trait]
    impl Tool for NeverDone {
        fn kind(&self) -> ToolKind {
            ToolKind::GeneralProcessing
        }
        fn description(&self) -> &str {
            "never signals completion"
        }
        async fn execute(&self, _input: &Value) -> Result<ToolResult, IaopError> {
            Ok(ToolResult::ok(json!({"partial": true})))
        }
    }

    fn controller(registry: ToolRegistry) -> Arc<TtController> {
        let reasoning = Arc::new(LlmReasoningTool::new(Arc::new(MockLlmClient)));
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::new(TaskScheduler::new(4)),
            5,
        ));
        Arc::new(TtController::new(
            StageEngine::new(reasoning, Duration::from_secs(5)),
            Arc::new(KeywordStrategySelector),
            executor,
            50,
        ))
    }

    #[tokio::test]
    async fn test_no_tools_runs_all_six_stages() {
        let ctl = controller(ToolRegistry::new());
        let ctx = TtContext::new("t1", "u", "hello");
        let events: Vec<TtEvent> = ctl
            .tt(ctx, TtLoopState::new("t1", 3, 1 << 20), CancellationToken::new())
            .collect()
            .await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, TtEventKind::TaskComplete);
        assert_eq!(last.success(), Some(true));
        assert_eq!(ctl.stages().invocations(Stage::Synthesis), 1);
        let completes = events.iter().filter(|e| e.kind == TtEventKind::StageComplete).count();
        assert_eq!(completes, 6);
    }

    #[tokio::test]
    async fn test_recursion_depth_counted_in_turns() {
        let mut reg = ToolRegistry::new();
        reg.register_tool(NeverDone);
        let ctl = controller(reg);
        let ctx = TtContext::new("t2", "u", "hello");
        let events: Vec<TtEvent> = ctl
            .tt(ctx, TtLoopState::new("t2", 2, 1 << 20), CancellationToken::new())
            .collect()
            .await;
        let turns: Vec<u32> = events
            .iter()
            .filter(|e| e.kind == TtEventKind::TurnStart)
            .map(|e| e.turn_counter)
            .collect();
        assert_eq!(turns, vec![0, 1]);
        let err = events.iter().find(|e| e.kind == TtEventKind::SystemError).unwrap();
        assert_eq!(err.data["error_kind"], "recursion_limit_exceeded");
        assert_eq!(err.turn_counter, 2);
        // 子帧事件先于父帧的 recursion_complete
        assert_eq!(events.last().unwrap().kind, TtEventKind::RecursionComplete);
        assert_eq!(events.last().unwrap().turn_counter, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctl = controller(ToolRegistry::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<TtEvent> = ctl
            .tt(TtContext::new("t3", "u", "x"), TtLoopState::new("t3", 3, 1 << 20), cancel)
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, TtEventKind::Cancelled);
        assert_eq!(events[1].data["error_kind"], "cancelled");
    }

    #[tokio::test]
    async fn test_compaction_under_memory_pressure() {
        let ctl = controller(ToolRegistry::new());
        let mut ctx = TtContext::new("t4", "u", "hello");
        ctx.message_history = (0..80).map(|i| Message::user(format!("message {i}"))).collect();
        let events: Vec<TtEvent> = ctl
            .tt(ctx, TtLoopState::new("t4", 3, 100), CancellationToken::new())
            .collect()
            .await;
        let compaction = events.iter().find(|e| e.kind == TtEventKind::MemoryCompaction).unwrap();
        assert_eq!(compaction.data["summarized_messages"], 30);
        assert_eq!(compaction.data["remaining_messages"], 51);
    }
}
