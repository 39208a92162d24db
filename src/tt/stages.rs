//! 阶段引擎：六个阶段的提示词、推理深度、输出解析与确定性降级记录
//!
//! LLM 阶段以流的形式运行：先产出 LLM 相关事件，最后恰好产出一个 Output。
//! 任何失败（调用出错、分片超时、输出非 JSON 对象）都产出该阶段的降级记录，从不向上返回错误。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::llm::{ChunkData, ReasoningDepth, ReasoningRequest, ReasoningTool};
use crate::tt::events::TtEventKind;
use crate::tt::heuristics::{ImplementationStrategy, StrategySelector};
use crate::tt::state::{Stage, TtContext};

pub type StageOutputs = HashMap<Stage, Value>;

/// LLM 阶段流的一步
#[derive(Debug, Clone)]
pub enum StageStep {
    Event { kind: TtEventKind, data: Value },
    Output { value: Value, fallback_reason: Option<String> },
}

pub type StageStepStream = Pin<Box<dyn Stream<Item = StageStep> + Send>>;

pub struct StageEngine {
    reasoning: Arc<dyn ReasoningTool>,
    stage_timeout: Duration,
    invocations: [AtomicUsize; 6],
}

impl StageEngine {
    pub fn new(reasoning: Arc<dyn ReasoningTool>, stage_timeout: Duration) -> Self {
        Self {
            reasoning,
            stage_timeout,
            invocations: Default::default(),
        }
    }

    /// 阶段被调用的累计次数
    pub fn invocations(&self, stage: Stage) -> usize {
        self.invocations[stage.index() - 1].load(Ordering::SeqCst)
    }

    fn record(&self, stage: Stage) {
        self.invocations[stage.index() - 1].fetch_add(1, Ordering::SeqCst);
    }

    pub fn depth(stage: Stage) -> ReasoningDepth {
        match stage {
            Stage::StructurePlanning | Stage::Synthesis => ReasoningDepth::Expert,
            Stage::Implementation => ReasoningDepth::Basic,
            _ => ReasoningDepth::Detailed,
        }
    }

    fn instruction(stage: Stage) -> (&'static str, &'static str) {
        match stage {
            Stage::IntentUnderstanding => (
                "Understand the core intent of the task.",
                r#"{"core_intent": "...", "complexity": "low|medium|high", "reasoning_type": "...", "expected_output": "...", "confidence": 0.0-1.0}"#,
            ),
            Stage::ContextAnalysis => (
                "Identify the key context elements, data quality, constraints and missing information.",
                r#"{"key_elements": ["..."], "data_quality": "...", "constraints": ["..."], "missing_information": ["..."], "confidence": 0.0-1.0}"#,
            ),
            Stage::StructurePlanning => (
                "Produce an ordered step plan with required tools, dependencies and risks.",
                r#"{"steps": ["..."], "required_tools": ["..."], "dependencies": ["..."], "risks": ["..."], "confidence": 0.0-1.0}"#,
            ),
            Stage::Implementation => ("Select an implementation strategy.", "{}"),
            Stage::Optimization => (
                "Review the implementation result and propose quality, performance and accuracy improvements.",
                r#"{"optimized_result": {}, "improvements": ["..."], "quality_assessment": "...", "confidence": 0.0-1.0}"#,
            ),
            Stage::Synthesis => (
                "Integrate everything into the final result with insights.",
                r#"{"final_result": {}, "insights": ["..."], "quality": "...", "confidence": 0.0-1.0}"#,
            ),
        }
    }

    /// 上一阶段的输出（阶段 1 没有）
    fn previous_output(stage: Stage, outputs: &StageOutputs) -> Option<&Value> {
        let prev = match stage {
            Stage::IntentUnderstanding => return None,
            Stage::ContextAnalysis => Stage::IntentUnderstanding,
            Stage::StructurePlanning => Stage::ContextAnalysis,
            Stage::Implementation => Stage::StructurePlanning,
            Stage::Optimization => Stage::Implementation,
            Stage::Synthesis => Stage::Optimization,
        };
        outputs.get(&prev)
    }

    pub fn prompt(stage: Stage, ctx: &TtContext, outputs: &StageOutputs) -> String {
        let (instruction, format) = Self::instruction(stage);
        let context = serde_json::to_string(&ctx.context_data).unwrap_or_default();
        let mut prompt = format!(
            "[stage: {}]\n{instruction}\n\nTask:\n{}\n\nContext:\n{context}\n",
            stage.as_str(),
            ctx.task_description
        );
        if let Some(prev) = Self::previous_output(stage, outputs) {
            prompt.push_str(&format!("\nPrevious stage output:\n{prev}\n"));
        }
        prompt.push_str(&format!("\nRespond with JSON only:\n{format}\n"));
        prompt
    }

    /// 各阶段的确定性降级记录（同样输入总是得到同样输出）
    pub fn fallback(stage: Stage, ctx: &TtContext, outputs: &StageOutputs) -> Value {
        let mut record = match stage {
            Stage::IntentUnderstanding => json!({
                "core_intent": ctx.task_description,
                "complexity": "medium",
                "reasoning_type": "analytical",
                "expected_output": "structured_result",
            }),
            Stage::ContextAnalysis => json!({
                "key_elements": ctx.context_data.keys().collect::<Vec<_>>(),
                "data_quality": "unknown",
                "constraints": [],
                "missing_information": [],
                "enhanced_context": ctx.context_data,
            }),
            Stage::StructurePlanning => json!({
                "steps": ["analyze", "process", "generate", "optimize"],
                "required_tools": [],
                "dependencies": [],
                "risks": [],
            }),
            Stage::Implementation => json!({
                "strategy": Value::Null,
                "tool_requests": [],
            }),
            Stage::Optimization => {
                let implementation = outputs
                    .get(&Stage::Implementation)
                    .map(|v| v.get("implementation_result").cloned().unwrap_or_else(|| v.clone()))
                    .unwrap_or(Value::Null);
                json!({
                    "optimized_result": implementation,
                    "improvements": [],
                    "quality_assessment": "acceptable",
                })
            }
            Stage::Synthesis => {
                let optimized = outputs
                    .get(&Stage::Optimization)
                    .map(|v| v.get("optimized_result").cloned().unwrap_or_else(|| v.clone()))
                    .unwrap_or(Value::Null);
                json!({
                    "final_result": optimized,
                    "insights": [],
                    "quality": "basic",
                })
            }
        };
        if let Some(obj) = record.as_object_mut() {
            obj.insert("confidence".into(), json!(0.5));
            obj.insert("fallback".into(), json!(true));
            obj.insert("llm_used".into(), json!(false));
        }
        record
    }

    /// LLM 输出必须是 JSON 对象；缺失字段用降级记录补齐
    fn finalize(value: Value, fallback: &Value) -> Option<Value> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        if let Some(defaults) = fallback.as_object() {
            for (k, v) in defaults {
                if !obj.contains_key(k) {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        obj.insert("fallback".into(), json!(false));
        obj.insert("llm_used".into(), json!(true));
        Some(Value::Object(obj))
    }

    /// 运行一个 LLM 阶段，返回事件 + 最终输出的流
    pub fn run_llm_stage(&self, stage: Stage, ctx: &TtContext, outputs: &StageOutputs) -> StageStepStream {
        self.record(stage);
        let prompt = Self::prompt(stage, ctx, outputs);
        let fallback = Self::fallback(stage, ctx, outputs);
        let depth = Self::depth(stage);
        let reasoning = Arc::clone(&self.reasoning);
        let limit = self.stage_timeout;
        let name = stage.as_str();

        Box::pin(async_stream::stream! {
            yield StageStep::Event {
                kind: TtEventKind::LlmCallStart,
                data: json!({"stage": name, "reasoning_depth": depth.as_str()}),
            };

            let failure = match timeout(limit, reasoning.execute(ReasoningRequest::new(prompt, depth))).await {
                Err(_) => "LLM call timed out".to_string(),
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(mut chunks)) => {
                    let mut received = 0usize;
                    loop {
                        match timeout(limit, chunks.next()).await {
                            Err(_) => break "LLM stream timed out".to_string(),
                            Ok(None) => break "LLM stream ended without a result".to_string(),
                            Ok(Some(chunk)) if !chunk.success => {
                                break match chunk.data {
                                    ChunkData::Message(m) => m,
                                    ChunkData::Result(v) => v.to_string(),
                                };
                            }
                            Ok(Some(chunk)) if chunk.is_partial => {
                                if let ChunkData::Message(delta) = chunk.data {
                                    received += delta.chars().count();
                                    yield StageStep::Event {
                                        kind: TtEventKind::LlmStreamDelta,
                                        data: json!({"stage": name, "delta": delta}),
                                    };
                                }
                            }
                            Ok(Some(chunk)) => {
                                let value = match chunk.data {
                                    ChunkData::Result(v) => v,
                                    ChunkData::Message(m) => Value::String(m),
                                };
                                match Self::finalize(value, &fallback) {
                                    Some(output) => {
                                        yield StageStep::Event {
                                            kind: TtEventKind::LlmCallComplete,
                                            data: json!({"stage": name, "streamed_chars": received}),
                                        };
                                        yield StageStep::Output { value: output, fallback_reason: None };
                                        return;
                                    }
                                    None => break "LLM response is not a JSON object".to_string(),
                                }
                            }
                        }
                    }
                }
            };

            tracing::warn!(stage = name, error = %failure, "stage fallback");
            yield StageStep::Event {
                kind: TtEventKind::LlmCallError,
                data: json!({"stage": name, "error": failure}),
            };
            yield StageStep::Output { value: fallback, fallback_reason: Some(failure) };
        })
    }

    /// 阶段 4：选择策略（不调用 LLM）
    pub fn plan_implementation(&self, selector: &dyn StrategySelector, ctx: &TtContext) -> ImplementationStrategy {
        self.record(Stage::Implementation);
        selector.select(&ctx.task_description, &ctx.context_data)
    }
}

/// 按策略相关度从上下文中取出子集
pub fn relevant_subset(ctx: &TtContext, strategy: &ImplementationStrategy) -> Map<String, Value> {
    strategy
        .relevant_context
        .iter()
        .filter(|(k, _)| k != "tool_results")
        .filter_map(|(k, _)| ctx.context_data.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FailingLlmClient, LlmReasoningTool, ScriptedLlmClient};

    fn engine(reasoning: Arc<dyn ReasoningTool>) -> StageEngine {
        StageEngine::new(reasoning, Duration::from_secs(5))
    }

    async fn drain(stream: StageStepStream) -> (Vec<TtEventKind>, Value, Option<String>) {
        let steps: Vec<StageStep> = stream.collect().await;
        let mut kinds = Vec::new();
        let mut out = (Value::Null, None);
        for step in steps {
            match step {
                StageStep::Event { kind, .. } => kinds.push(kind),
                StageStep::Output { value, fallback_reason } => out = (value, fallback_reason),
            }
        }
        (kinds, out.0, out.1)
    }

    #[tokio::test]
    async fn test_llm_stage_success_streams_and_marks_llm_used() {
        let llm = Arc::new(ScriptedLlmClient::new(
            r#"{"core_intent": "sales stats", "complexity": "low", "confidence": 0.9}"#,
        ));
        let e = engine(Arc::new(LlmReasoningTool::new(llm)));
        let ctx = TtContext::new("t", "u", "生成上月销售额统计");
        let (kinds, out, reason) =
            drain(e.run_llm_stage(Stage::IntentUnderstanding, &ctx, &StageOutputs::new())).await;
        assert_eq!(kinds.first(), Some(&TtEventKind::LlmCallStart));
        assert!(kinds.contains(&TtEventKind::LlmStreamDelta));
        assert_eq!(kinds.last(), Some(&TtEventKind::LlmCallComplete));
        assert!(reason.is_none());
        assert_eq!(out["core_intent"], "sales stats");
        assert_eq!(out["llm_used"], true);
        assert_eq!(out["fallback"], false);
        // 缺失字段由降级记录补齐
        assert_eq!(out["reasoning_type"], "analytical");
        assert_eq!(e.invocations(Stage::IntentUnderstanding), 1);
    }

    #[tokio::test]
    async fn test_failing_llm_yields_documented_fallback() {
        let e = engine(Arc::new(LlmReasoningTool::new(Arc::new(FailingLlmClient::default()))));
        let ctx = TtContext::new("t", "u", "统计").with_context("b", json!(1)).with_context("a", json!(2));
        let (kinds, out, reason) =
            drain(e.run_llm_stage(Stage::ContextAnalysis, &ctx, &StageOutputs::new())).await;
        assert!(kinds.contains(&TtEventKind::LlmCallError));
        assert!(reason.is_some());
        assert_eq!(out, StageEngine::fallback(Stage::ContextAnalysis, &ctx, &StageOutputs::new()));
        assert_eq!(out["key_elements"], json!(["a", "b"]));
        assert_eq!(out["confidence"], 0.5);
    }

    #[tokio::test]
    async fn test_non_object_response_falls_back() {
        let llm = Arc::new(ScriptedLlmClient::new("plain text answer"));
        let e = engine(Arc::new(LlmReasoningTool::new(llm)));
        let ctx = TtContext::new("t", "u", "x");
        let (_, out, reason) = drain(e.run_llm_stage(Stage::StructurePlanning, &ctx, &StageOutputs::new())).await;
        assert_eq!(out["steps"], json!(["analyze", "process", "generate", "optimize"]));
        assert_eq!(out["fallback"], true);
        assert!(reason.unwrap_or_default().contains("not a JSON object"));
    }

    #[tokio::test]
    async fn test_stage_timeout_falls_back() {
        let llm = Arc::new(ScriptedLlmClient::new("{}").with_delay(Duration::from_millis(300)));
        let e = StageEngine::new(Arc::new(LlmReasoningTool::new(llm)), Duration::from_millis(50));
        let ctx = TtContext::new("t", "u", "x");
        let (_, out, reason) = drain(e.run_llm_stage(Stage::Synthesis, &ctx, &StageOutputs::new())).await;
        assert_eq!(out["quality"], "basic");
        assert!(reason.unwrap_or_default().contains("timed out"));
    }

    #[test]
    fn test_optimization_and_synthesis_fallbacks_chain() {
        let ctx = TtContext::new("t", "u", "x");
        let mut outputs = StageOutputs::new();
        outputs.insert(Stage::Implementation, json!({"implementation_result": {"k": 1}}));
        let opt = StageEngine::fallback(Stage::Optimization, &ctx, &outputs);
        assert_eq!(opt["optimized_result"], json!({"k": 1}));
        assert_eq!(opt["quality_assessment"], "acceptable");
        outputs.insert(Stage::Optimization, opt);
        let syn = StageEngine::fallback(Stage::Synthesis, &ctx, &outputs);
        assert_eq!(syn["final_result"], json!({"k": 1}));
        assert_eq!(syn["quality"], "basic");
    }

    #[test]
    fn test_prompt_carries_stage_marker_and_previous_output() {
        let ctx = TtContext::new("t", "u", "生成上月销售额统计");
        let mut outputs = StageOutputs::new();
        outputs.insert(Stage::IntentUnderstanding, json!({"core_intent": "stats"}));
        let p = StageEngine::prompt(Stage::ContextAnalysis, &ctx, &outputs);
        assert!(p.starts_with("[stage: context_analysis]"));
        assert!(p.contains("stats"));
        assert!(p.contains("生成上月销售额统计"));
    }
}
