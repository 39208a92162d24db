//! 工具层：类型化 Tool trait、注册表、并行隔离执行器与内置业务工具

pub mod analysis;
pub mod datasource;
pub mod executor;
pub mod placeholder;
pub mod prompts;
pub mod registry;
pub mod sql_generation;

pub use analysis::AnalysisTool;
pub use datasource::{ConnectivityReport, ContextDataSourceProbe, DataSourceProbe, StaticProbe};
pub use executor::{BatchOutcome, ToolExecution, ToolExecutor};
pub use placeholder::{infer_time_range, parse_placeholders, ParsedPlaceholder, PlaceholderAnalysisTool};
pub use prompts::{
    build_tool_prompt, DataSensitivity, PromptAdaptation, SpecializedAgentType, Urgency, UserRole,
};
pub use registry::{Tool, ToolInput, ToolKind, ToolRegistry, ToolRequest, ToolResult};
pub use sql_generation::{quality_score, validate_sql_syntax, SqlGenerationTool, SqlValidation};
