//! LLM 型工具的提示词模板：专用 Agent 角色说明 + 上下文敏感度提示

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 专用 Agent 类型，决定工具提示词中的角色说明
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecializedAgentType {
    PlaceholderExpert,
    SqlExpert,
    DataAnalyst,
    ReportWriter,
    BusinessAnalyst,
    #[default]
    GeneralAssistant,
}

impl SpecializedAgentType {
    pub fn role_instructions(&self) -> &'static str {
        match self {
            SpecializedAgentType::PlaceholderExpert => {
                "You are a report template expert. Identify what data each placeholder needs, its statistic type and time range."
            }
            SpecializedAgentType::SqlExpert => {
                "You are a senior SQL engineer. Write a single read-only SELECT statement against the given data source. Never modify data."
            }
            SpecializedAgentType::DataAnalyst => {
                "You are a data analyst. Describe trends, comparisons and anomalies found in the data."
            }
            SpecializedAgentType::ReportWriter => {
                "You are a business report writer. Turn analysis results into a clear narrative section."
            }
            SpecializedAgentType::BusinessAnalyst => {
                "You are a business intelligence analyst. Derive KPIs, insights and decision recommendations."
            }
            SpecializedAgentType::GeneralAssistant => {
                "You are a careful assistant. Complete the task using only the supplied context."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Executive,
    Analyst,
    Developer,
    #[default]
    BusinessUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSensitivity {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// 从任务文本与上下文形态推断出的提示词调整参数
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptAdaptation {
    pub user_role: UserRole,
    pub data_sensitivity: DataSensitivity,
    pub urgency: Urgency,
    pub resource_constrained: bool,
}

impl PromptAdaptation {
    /// 敏感度、受众、紧急度相关的附加说明
    pub fn framing(&self) -> String {
        let mut lines = Vec::new();
        match self.data_sensitivity {
            DataSensitivity::High => lines.push(
                "The data is sensitive: aggregate results, never select personal identifiers.",
            ),
            DataSensitivity::Medium => {
                lines.push("Prefer aggregated figures over row-level detail.")
            }
            DataSensitivity::Low => {}
        }
        match self.user_role {
            UserRole::Executive => lines.push("The audience is an executive: lead with the headline number."),
            UserRole::Developer => lines.push("The audience is technical: include precise definitions."),
            UserRole::Analyst | UserRole::BusinessUser => {}
        }
        if self.urgency == Urgency::High {
            lines.push("The request is urgent: keep the answer short.");
        }
        if self.resource_constrained {
            lines.push("Resources are constrained: avoid expensive joins and full scans.");
        }
        lines.join("\n")
    }
}

/// 组装工具提示词：标记行、角色说明、敏感度提示、任务与上下文、输出格式要求
pub fn build_tool_prompt(
    tool_marker: &str,
    agent_type: SpecializedAgentType,
    adaptation: &PromptAdaptation,
    task: &str,
    context: &Value,
    output_format: &str,
) -> String {
    let framing = adaptation.framing();
    let context_text =
        serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
    let mut prompt = format!("[tool: {tool_marker}]\n{}\n", agent_type.role_instructions());
    if !framing.is_empty() {
        prompt.push_str(&framing);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nTask:\n{task}\n\nContext:\n{context_text}\n\nRespond with JSON only:\n{output_format}\n"
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_contains_marker_role_and_framing() {
        let adaptation = PromptAdaptation {
            data_sensitivity: DataSensitivity::High,
            urgency: Urgency::High,
            ..Default::default()
        };
        let prompt = build_tool_prompt(
            "sql_generation",
            SpecializedAgentType::SqlExpert,
            &adaptation,
            "统计销售额",
            &json!({"placeholder_text": "上月销售额"}),
            "{\"sql_query\": \"...\"}",
        );
        assert!(prompt.starts_with("[tool: sql_generation]"));
        assert!(prompt.contains("senior SQL engineer"));
        assert!(prompt.contains("never select personal identifiers"));
        assert!(prompt.contains("urgent"));
        assert!(prompt.contains("上月销售额"));
    }

    #[test]
    fn test_default_adaptation_has_no_framing() {
        assert!(PromptAdaptation::default().framing().is_empty());
    }
}
