//! LLM 驱动的分析类工具：数据分析、报告生成、商业智能、通用处理
//!
//! 同一实现按 ToolKind 区分角色与输出格式；作为策略末位工具且置信度达到阈值时宣告任务完成。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::IaopError;
use crate::llm::{reason_to_completion, ReasoningDepth, ReasoningRequest, ReasoningTool};
use crate::tools::prompts::{build_tool_prompt, SpecializedAgentType};
use crate::tools::{Tool, ToolInput, ToolKind, ToolResult};

const COMPLETION_CONFIDENCE: f64 = 0.75;

pub struct AnalysisTool {
    kind: ToolKind,
    reasoning: Arc<dyn ReasoningTool>,
}

impl AnalysisTool {
    pub fn new(kind: ToolKind, reasoning: Arc<dyn ReasoningTool>) -> Self {
        Self { kind, reasoning }
    }

    /// 为所有分析类工具各建一个实例
    pub fn all(reasoning: Arc<dyn ReasoningTool>) -> Vec<AnalysisTool> {
        [
            ToolKind::DataAnalysis,
            ToolKind::ReportGeneration,
            ToolKind::BusinessIntelligence,
            ToolKind::GeneralProcessing,
        ]
        .into_iter()
        .map(|k| AnalysisTool::new(k, Arc::clone(&reasoning)))
        .collect()
    }

    fn default_agent(&self) -> SpecializedAgentType {
        match self.kind {
            ToolKind::DataAnalysis => SpecializedAgentType::DataAnalyst,
            ToolKind::ReportGeneration => SpecializedAgentType::ReportWriter,
            ToolKind::BusinessIntelligence => SpecializedAgentType::BusinessAnalyst,
            ToolKind::PlaceholderAnalysis => SpecializedAgentType::PlaceholderExpert,
            ToolKind::SqlGeneration => SpecializedAgentType::SqlExpert,
            ToolKind::GeneralProcessing => SpecializedAgentType::GeneralAssistant,
        }
    }

    fn depth(&self) -> ReasoningDepth {
        match self.kind {
            ToolKind::BusinessIntelligence => ReasoningDepth::Expert,
            ToolKind::GeneralProcessing => ReasoningDepth::Basic,
            _ => ReasoningDepth::Detailed,
        }
    }

    fn output_format(&self) -> &'static str {
        match self.kind {
            ToolKind::ReportGeneration => {
                r#"{"title": "...", "narrative": "...", "sections": ["..."], "confidence": 0.0-1.0}"#
            }
            ToolKind::BusinessIntelligence => {
                r#"{"kpis": ["..."], "insights": ["..."], "recommendations": ["..."], "confidence": 0.0-1.0}"#
            }
            _ => r#"{"summary": "...", "findings": ["..."], "confidence": 0.0-1.0}"#,
        }
    }
}

#[async_trait]
impl Tool for AnalysisTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        match self.kind {
            ToolKind::DataAnalysis => "Analyze data trends, comparisons and anomalies.",
            ToolKind::ReportGeneration => "Write a narrative report section from analysis results.",
            ToolKind::BusinessIntelligence => "Derive KPIs, insights and recommendations.",
            _ => "Process a general request using the supplied context.",
        }
    }

    async fn execute(&self, input: &Value) -> Result<ToolResult, IaopError> {
        let input = ToolInput::parse(input)?;
        let agent_type = match input.agent_type {
            SpecializedAgentType::GeneralAssistant => self.default_agent(),
            other => other,
        };
        let mut context = input.context_value();
        if !input.previous_results.is_null() {
            if let Some(obj) = context.as_object_mut() {
                obj.insert("previous_results".into(), input.previous_results.clone());
            }
        }
        let prompt = build_tool_prompt(
            self.kind.as_str(),
            agent_type,
            &input.prompt_adaptation,
            &input.task,
            &context,
            self.output_format(),
        );

        let response = reason_to_completion(self.reasoning.as_ref(), ReasoningRequest::new(prompt, self.depth())).await?;
        let confidence = response
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let output = json!({
            "analysis": response,
            "confidence": confidence,
        });

        if input.terminal && confidence >= COMPLETION_CONFIDENCE {
            Ok(ToolResult::completed(output))
        } else {
            Ok(ToolResult::ok(output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmReasoningTool, ScriptedLlmClient};

    fn reasoning(response: &str) -> Arc<dyn ReasoningTool> {
        Arc::new(LlmReasoningTool::new(Arc::new(ScriptedLlmClient::new(response))))
    }

    #[tokio::test]
    async fn test_terminal_confident_analysis_completes() {
        let tool = AnalysisTool::new(
            ToolKind::DataAnalysis,
            reasoning(r#"{"summary": "up 5%", "confidence": 0.8}"#),
        );
        let r = tool
            .execute(&json!({"task": "分析趋势", "terminal": true}))
            .await
            .unwrap();
        assert!(r.completion_signal);
        assert_eq!(r.output["analysis"]["summary"], "up 5%");
    }

    #[tokio::test]
    async fn test_low_confidence_continues() {
        let tool = AnalysisTool::new(
            ToolKind::ReportGeneration,
            reasoning(r#"{"narrative": "draft", "confidence": 0.4}"#),
        );
        let r = tool
            .execute(&json!({"task": "写报告", "terminal": true}))
            .await
            .unwrap();
        assert!(r.success && !r.completion_signal);
    }

    #[test]
    fn test_all_covers_analysis_kinds() {
        let kinds: Vec<ToolKind> = AnalysisTool::all(reasoning("{}")).iter().map(|t| t.kind()).collect();
        assert_eq!(kinds.len(), 4);
        assert!(!kinds.contains(&ToolKind::SqlGeneration));
    }
}
