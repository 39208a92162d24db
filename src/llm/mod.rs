//! LLM 层：客户端抽象、OpenAI 兼容实现、Mock/脚本化客户端与推理工具契约

pub mod mock;
pub mod openai;
pub mod reasoning;
pub mod traits;

pub use mock::{FailingLlmClient, MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use reasoning::{
    extract_json, reason_to_completion, ChunkData, LlmReasoningTool, ReasoningChunk, ReasoningDepth,
    ReasoningRequest, ReasoningStream, ReasoningTool,
};
pub use traits::{LlmClient, LlmError, TokenStream};
