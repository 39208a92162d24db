//! 工具注册表
//!
//! 所有工具实现 Tool trait（kind / description / execute），按 ToolKind 注册与查找；
//! ToolExecutor 在调用时施加超时、隔离错误并输出审计日志。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::IaopError;
use crate::tools::prompts::{PromptAdaptation, SpecializedAgentType};

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    PlaceholderAnalysis,
    SqlGeneration,
    DataAnalysis,
    ReportGeneration,
    BusinessIntelligence,
    GeneralProcessing,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::PlaceholderAnalysis,
        ToolKind::SqlGeneration,
        ToolKind::DataAnalysis,
        ToolKind::ReportGeneration,
        ToolKind::BusinessIntelligence,
        ToolKind::GeneralProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::PlaceholderAnalysis => "placeholder_analysis",
            ToolKind::SqlGeneration => "sql_generation",
            ToolKind::DataAnalysis => "data_analysis",
            ToolKind::ReportGeneration => "report_generation",
            ToolKind::BusinessIntelligence => "business_intelligence",
            ToolKind::GeneralProcessing => "general_processing",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具执行结果；completion_signal 为 true 表示整个任务已结束（无论成败）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub completion_signal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// 成功，任务继续
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            completion_signal: false,
            error: None,
        }
    }

    /// 成功并宣告任务完成
    pub fn completed(output: Value) -> Self {
        Self {
            success: true,
            output,
            completion_signal: true,
            error: None,
        }
    }

    /// 失败并宣告任务结束（不再重试）
    pub fn failed_completion(output: Value, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output,
            completion_signal: true,
            error: Some(error.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            completion_signal: false,
            error: Some(error.into()),
        }
    }
}

/// 一次工具调用请求：{"tool": kind, "input": {...}}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: ToolKind,
    pub input: Value,
}

impl ToolRequest {
    pub fn new(tool: ToolKind, input: Value) -> Self {
        Self { tool, input }
    }
}

/// 实现阶段为每个工具组装的标准输入
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolInput {
    pub task: String,
    /// 按相关度筛选后的上下文子集
    pub context: serde_json::Map<String, Value>,
    pub agent_type: SpecializedAgentType,
    pub prompt_adaptation: PromptAdaptation,
    pub strategy: String,
    /// 是否为策略执行顺序中的最后一个工具；只有末位工具可以宣告任务完成
    pub terminal: bool,
    /// 上一轮工具结果（递归轮次才有）
    pub previous_results: Value,
}

impl ToolInput {
    pub fn parse(input: &Value) -> Result<Self, IaopError> {
        serde_json::from_value(input.clone()).map_err(|e| IaopError::JsonParse(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn context_value(&self) -> Value {
        Value::Object(self.context.clone())
    }
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// 工具描述
    fn description(&self) -> &str;

    async fn execute(&self, input: &Value) -> Result<ToolResult, IaopError>;
}

/// 工具注册表：每个 ToolKind 至多一个实现，重复注册覆盖
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.kind(), tool);
    }

    pub fn register_tool(&mut self, tool: impl Tool + 'static) {
        self.register(Arc::new(tool));
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(&kind)
    }

    /// 已注册的工具类别（有序）
    pub fn kinds(&self) -> Vec<ToolKind> {
        let mut kinds: Vec<ToolKind> = self.tools.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn tool_descriptions(&self) -> Vec<(ToolKind, String)> {
        self.kinds()
            .into_iter()
            .filter_map(|k| self.tools.get(&k).map(|t| (k, t.description().to_string())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
