//! 占位符解析工具
//!
//! 解析 `{{类型: 描述}}` 形式的占位符并推断时间范围；配置了推理工具时再做一次 basic 深度的语义补充（失败不影响结果）。

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::IaopError;
use crate::llm::{reason_to_completion, ReasoningDepth, ReasoningRequest, ReasoningTool};
use crate::tools::prompts::{build_tool_prompt, SpecializedAgentType};
use crate::tools::{Tool, ToolInput, ToolKind, ToolResult};

const COMPLETION_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPlaceholder {
    pub placeholder_type: String,
    pub description: String,
    pub raw: String,
}

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*:\s*([^}]+?)\s*\}\}").ok())
        .as_ref()
}

fn last_n_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:last|past)\s+(\d+)\s+months?|近\s*(\d+)\s*个月").ok())
        .as_ref()
}

/// 提取文本中的全部占位符
pub fn parse_placeholders(text: &str) -> Vec<ParsedPlaceholder> {
    let Some(re) = placeholder_re() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|cap| {
            Some(ParsedPlaceholder {
                placeholder_type: cap.get(1)?.as_str().to_string(),
                description: cap.get(2)?.as_str().to_string(),
                raw: cap.get(0)?.as_str().to_string(),
            })
        })
        .collect()
}

/// 由中英文时间词推断时间范围标识，如 last_month、last_6_months
pub fn infer_time_range(text: &str) -> Option<String> {
    if let Some(cap) = last_n_re().and_then(|re| re.captures(text)) {
        let n = cap.get(1).or_else(|| cap.get(2)).map(|m| m.as_str());
        if let Some(n) = n {
            return Some(format!("last_{n}_months"));
        }
    }
    let lower = text.to_lowercase();
    let rules: [(&[&str], &str); 6] = [
        (&["上月", "上个月", "last month"], "last_month"),
        (&["本月", "这个月", "this month"], "this_month"),
        (&["去年", "last year"], "last_year"),
        (&["今年", "本年", "this year"], "this_year"),
        (&["季度", "quarter"], "quarter"),
        (&["昨天", "yesterday"], "yesterday"),
    ];
    rules
        .iter()
        .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, range)| range.to_string())
}

pub struct PlaceholderAnalysisTool {
    reasoning: Option<Arc<dyn ReasoningTool>>,
}

impl PlaceholderAnalysisTool {
    pub fn new(reasoning: Option<Arc<dyn ReasoningTool>>) -> Self {
        Self { reasoning }
    }
}

#[async_trait]
impl Tool for PlaceholderAnalysisTool {
    fn kind(&self) -> ToolKind {
        ToolKind::PlaceholderAnalysis
    }

    fn description(&self) -> &str {
        "Parse report placeholders and infer their statistic type and time range."
    }

    async fn execute(&self, input: &Value) -> Result<ToolResult, IaopError> {
        let input = ToolInput::parse(input)?;
        let text = input
            .context
            .get("placeholder_text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| input.task.clone());

        let placeholders = parse_placeholders(&text);
        let time_range = infer_time_range(&text).or_else(|| infer_time_range(&input.task));
        let mut confidence: f64 = if placeholders.is_empty() { 0.6 } else { 0.8 };
        if time_range.is_some() {
            confidence += 0.1;
        }

        let mut semantic = Value::Null;
        if let Some(reasoning) = &self.reasoning {
            let prompt = build_tool_prompt(
                ToolKind::PlaceholderAnalysis.as_str(),
                SpecializedAgentType::PlaceholderExpert,
                &input.prompt_adaptation,
                &text,
                &input.context_value(),
                r#"{"semantic_type": "...", "metrics": ["..."], "confidence": 0.0-1.0}"#,
            );
            match reason_to_completion(reasoning.as_ref(), ReasoningRequest::new(prompt, ReasoningDepth::Basic)).await {
                Ok(v) => {
                    if let Some(c) = v.get("confidence").and_then(Value::as_f64) {
                        confidence = (confidence + c.clamp(0.0, 1.0)) / 2.0;
                    }
                    semantic = v;
                }
                Err(e) => tracing::debug!(error = %e, "placeholder semantic enrichment skipped"),
            }
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let output = json!({
            "placeholder_text": text,
            "placeholders": placeholders,
            "time_range": time_range,
            "semantic": semantic,
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

    #[test]
    fn test_parse_placeholders() {
        let found = parse_placeholders("本月 {{bar_chart: sales by region for last 6 months}} 以及 {{统计: 上月销售额}}");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].placeholder_type, "bar_chart");
        assert_eq!(found[0].description, "sales by region for last 6 months");
        assert_eq!(found[1].placeholder_type, "统计");
        assert!(parse_placeholders("no placeholders").is_empty());
    }

    #[test]
    fn test_infer_time_range() {
        assert_eq!(infer_time_range("sales for last 6 months").as_deref(), Some("last_6_months"));
        assert_eq!(infer_time_range("近3个月趋势").as_deref(), Some("last_3_months"));
        assert_eq!(infer_time_range("上月销售额").as_deref(), Some("last_month"));
        assert_eq!(infer_time_range("去年营收").as_deref(), Some("last_year"));
        assert_eq!(infer_time_range("销售额"), None);
    }

    #[tokio::test]
    async fn test_completes_only_as_terminal_tool() {
        let tool = PlaceholderAnalysisTool::new(None);
        let r = tool
            .execute(&json!({
                "task": "解析占位符",
                "context": {"placeholder_text": "{{统计: 上月销售额}}"},
                "strategy": "specialized_placeholder_analysis",
                "terminal": true
            }))
            .await
            .unwrap();
        assert!(r.success && r.completion_signal);
        assert_eq!(r.output["time_range"], "last_month");

        let r = tool
            .execute(&json!({
                "task": "生成报告",
                "context": {"placeholder_text": "{{统计: 上月销售额}}"},
                "strategy": "adaptive_report_generation",
                "terminal": false
            }))
            .await
            .unwrap();
        assert!(r.success && !r.completion_signal);
    }
}
