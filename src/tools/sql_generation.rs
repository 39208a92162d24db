//! SQL 生成工具
//!
//! 专家深度推理生成 SQL，然后做两项独立校验：语法粗检（SELECT/FROM、括号配平）与数据源连通性探测（有限次重试 + 固定退避）。
//! 只有语法有效、数据源可连、综合质量分超过阈值时才宣告任务完成；探测重试耗尽则宣告失败完成。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::SqlSection;
use crate::core::IaopError;
use crate::llm::{reason_to_completion, ReasoningDepth, ReasoningRequest, ReasoningTool};
use crate::tools::datasource::{ConnectivityReport, DataSourceProbe};
use crate::tools::prompts::{build_tool_prompt, SpecializedAgentType};
use crate::tools::{Tool, ToolInput, ToolKind, ToolResult};

const OUTPUT_FORMAT: &str = r#"{"sql_query": "SELECT ...", "business_logic": "what the query computes", "confidence": 0.0-1.0}"#;

/// 语法粗检结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlValidation {
    pub valid: bool,
    pub issues: Vec<String>,
}

fn has_keyword(sql: &str, keyword: &str) -> bool {
    sql.split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|w| w.eq_ignore_ascii_case(keyword))
}

/// 语法粗检：必须包含 SELECT 与 FROM，括号配平（忽略单引号字符串内的括号）
pub fn validate_sql_syntax(sql: &str) -> SqlValidation {
    let mut issues = Vec::new();
    let sql = sql.trim();
    if sql.is_empty() {
        issues.push("empty query".to_string());
    }
    if !has_keyword(sql, "SELECT") {
        issues.push("missing SELECT".to_string());
    }
    if !has_keyword(sql, "FROM") {
        issues.push("missing FROM".to_string());
    }

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut unbalanced = false;
    for c in sql.chars() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth < 0 {
                    unbalanced = true;
                }
            }
            _ => {}
        }
    }
    if unbalanced || depth != 0 {
        issues.push("unbalanced parentheses".to_string());
    }

    SqlValidation {
        valid: issues.is_empty(),
        issues,
    }
}

/// 质量分 = 0.4·语法 + 0.3·连通 + 0.3·模型置信度
pub fn quality_score(syntax_valid: bool, connected: bool, llm_confidence: f64) -> f64 {
    let s = if syntax_valid { 1.0 } else { 0.0 };
    let c = if connected { 1.0 } else { 0.0 };
    0.4 * s + 0.3 * c + 0.3 * llm_confidence.clamp(0.0, 1.0)
}

pub struct SqlGenerationTool {
    reasoning: Arc<dyn ReasoningTool>,
    probe: Arc<dyn DataSourceProbe>,
    policy: SqlSection,
}

impl SqlGenerationTool {
    pub fn new(
        reasoning: Arc<dyn ReasoningTool>,
        probe: Arc<dyn DataSourceProbe>,
        policy: SqlSection,
    ) -> Self {
        Self {
            reasoning,
            probe,
            policy,
        }
    }

    /// 探测数据源，失败时按固定退避重试；返回最后一次报告与尝试次数
    async fn probe_with_retry(&self, data_source: &Value) -> (ConnectivityReport, u32) {
        let max_attempts = self.policy.probe_max_attempts.max(1);
        let backoff = Duration::from_millis(self.policy.probe_backoff_ms);
        let mut attempt = 1;
        loop {
            let report = self.probe.check_connection(data_source).await;
            if report.connected || attempt >= max_attempts {
                return (report, attempt);
            }
            tracing::warn!(
                attempt,
                max_attempts,
                error = report.error.as_deref().unwrap_or(""),
                "data source probe failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Tool for SqlGenerationTool {
    fn kind(&self) -> ToolKind {
        ToolKind::SqlGeneration
    }

    fn description(&self) -> &str {
        "Generate a read-only SQL query for a placeholder and validate it against the data source."
    }

    async fn execute(&self, input: &Value) -> Result<ToolResult, IaopError> {
        let input = ToolInput::parse(input)?;
        let agent_type = match input.agent_type {
            SpecializedAgentType::GeneralAssistant => SpecializedAgentType::SqlExpert,
            other => other,
        };
        let mut context = input.context_value();
        if !input.previous_results.is_null() {
            if let Some(obj) = context.as_object_mut() {
                obj.insert("previous_results".into(), input.previous_results.clone());
            }
        }
        let prompt = build_tool_prompt(
            ToolKind::SqlGeneration.as_str(),
            agent_type,
            &input.prompt_adaptation,
            &input.task,
            &context,
            OUTPUT_FORMAT,
        );

        let response =
            reason_to_completion(self.reasoning.as_ref(), ReasoningRequest::new(prompt, ReasoningDepth::Expert))
                .await?;

        let sql = response
            .get("sql_query")
            .or_else(|| response.get("sql"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if sql.is_empty() {
            return Ok(ToolResult::failed("model response contains no SQL"));
        }
        let business_logic = response
            .get("business_logic")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let llm_confidence = response
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let validation = validate_sql_syntax(&sql);
        let data_source = input
            .context
            .get("data_source_context")
            .cloned()
            .unwrap_or(Value::Null);
        let (connectivity, attempts) = self.probe_with_retry(&data_source).await;
        let quality = quality_score(validation.valid, connectivity.connected, llm_confidence);

        let output = json!({
            "sql_query": sql,
            "business_logic": business_logic,
            "confidence": quality,
            "llm_confidence": llm_confidence,
            "syntax_validation": validation,
            "connectivity": connectivity,
            "probe_attempts": attempts,
        });

        if !connectivity.connected {
            let reason = format!(
                "data source unreachable after {attempts} attempts: {}",
                connectivity.error.as_deref().unwrap_or("unknown error")
            );
            return Ok(ToolResult::failed_completion(output, reason));
        }
        if !validation.valid {
            return Ok(ToolResult {
                success: false,
                output,
                completion_signal: false,
                error: Some(format!("invalid SQL: {}", validation.issues.join(", "))),
            });
        }
        if quality > self.policy.quality_threshold {
            Ok(ToolResult::completed(output))
        } else {
            Ok(ToolResult::ok(output))
        }
    }
}
