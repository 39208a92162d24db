//! 平台错误类型
//!
//! 编排边界（AgentCoordinator::execute_task）不会把 IaopError 抛给调用方，而是折叠为带 success/error 的 TaskOutcome。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排、工具、上下文各层可能出现的错误
#[derive(Error, Debug)]
pub enum IaopError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Tool execution failed: {tool}: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Recursion limit exceeded: turn {turn} >= max depth {max_depth}")]
    RecursionLimitExceeded { turn: u32, max_depth: u32 },

    #[error("Task timed out after {0}s")]
    TaskTimeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid agent chain '{chain}': {reason}")]
    InvalidChain { chain: String, reason: String },

    #[error("Dependency cycle among placeholders: {0}")]
    DependencyCycle(String),

    #[error("Unknown placeholder dependency: {placeholder} depends on {missing}")]
    UnknownDependency { placeholder: String, missing: String },

    #[error("Duplicate placeholder id: {0}")]
    DuplicatePlaceholder(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Context error: {0}")]
    Context(String),
}

impl IaopError {
    /// 事件与日志中使用的稳定错误类别名
    pub fn kind(&self) -> &'static str {
        match self {
            IaopError::Llm(_) => "llm_error",
            IaopError::JsonParse(_) => "json_parse_error",
            IaopError::ToolExecutionFailed { .. } => "tool_execution_failed",
            IaopError::ToolTimeout(_) => "tool_timeout",
            IaopError::UnknownTool(_) => "unknown_tool",
            IaopError::RecursionLimitExceeded { .. } => "recursion_limit_exceeded",
            IaopError::TaskTimeout(_) => "task_timeout",
            IaopError::Cancelled => "cancelled",
            IaopError::AgentNotFound(_) => "agent_not_found",
            IaopError::InvalidChain { .. } => "invalid_chain",
            IaopError::DependencyCycle(_) => "dependency_cycle",
            IaopError::UnknownDependency { .. } => "unknown_dependency",
            IaopError::DuplicatePlaceholder(_) => "duplicate_placeholder",
            IaopError::Config(_) => "config_error",
            IaopError::Context(_) => "context_error",
        }
    }
}
