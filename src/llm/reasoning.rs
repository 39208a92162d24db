//! 推理工具契约：在 LlmClient 之上提供带推理深度的流式推理调用
//!
//! 每个分片带 success / is_partial；部分分片为增量文本，首个非部分的成功分片即为阶段答案。

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LlmClient, LlmError};
use crate::memory::Message;

/// 推理深度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningDepth {
    Basic,
    Detailed,
    Expert,
}

impl ReasoningDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningDepth::Basic => "basic",
            ReasoningDepth::Detailed => "detailed",
            ReasoningDepth::Expert => "expert",
        }
    }

    fn system_instruction(&self) -> &'static str {
        match self {
            ReasoningDepth::Basic => "Answer concisely. Respond with a single JSON object.",
            ReasoningDepth::Detailed => {
                "Reason step by step before answering. Respond with a single JSON object."
            }
            ReasoningDepth::Expert => {
                "You are a domain expert. Consider edge cases, validate assumptions and respond with a single JSON object."
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub problem: String,
    pub reasoning_depth: ReasoningDepth,
}

impl ReasoningRequest {
    pub fn new(problem: impl Into<String>, depth: ReasoningDepth) -> Self {
        Self {
            problem: problem.into(),
            reasoning_depth: depth,
        }
    }
}

/// 分片负载：增量消息或最终结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkData {
    Message(String),
    Result(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningChunk {
    pub success: bool,
    pub is_partial: bool,
    pub data: ChunkData,
}

impl ReasoningChunk {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            success: true,
            is_partial: true,
            data: ChunkData::Message(text.into()),
        }
    }

    pub fn final_result(value: Value) -> Self {
        Self {
            success: true,
            is_partial: false,
            data: ChunkData::Result(value),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            is_partial: false,
            data: ChunkData::Message(message.into()),
        }
    }
}

pub type ReasoningStream = Pin<Box<dyn Stream<Item = ReasoningChunk> + Send>>;

/// 推理工具：阶段与 LLM 型工具通过它调用模型
#[async_trait]
pub trait ReasoningTool: Send + Sync {
    async fn execute(&self, request: ReasoningRequest) -> Result<ReasoningStream, LlmError>;
}

/// 基于 LlmClient 的推理工具：Token 流逐个转为部分分片，结束时给出完整结果
pub struct LlmReasoningTool {
    llm: Arc<dyn LlmClient>,
}

impl LlmReasoningTool {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ReasoningTool for LlmReasoningTool {
    async fn execute(&self, request: ReasoningRequest) -> Result<ReasoningStream, LlmError> {
        let messages = vec![
            Message::system(request.reasoning_depth.system_instruction()),
            Message::user(request.problem),
        ];
        let mut tokens = self.llm.complete_stream(&messages).await?;

        let stream = async_stream::stream! {
            let mut full = String::new();
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(token) => {
                        full.push_str(&token);
                        yield ReasoningChunk::partial(token);
                    }
                    Err(e) => {
                        yield ReasoningChunk::failure(e.to_string());
                        return;
                    }
                }
            }
            let result = extract_json(&full).unwrap_or(Value::String(full));
            yield ReasoningChunk::final_result(result);
        };
        Ok(Box::pin(stream))
    }
}

/// 消费推理流直到首个非部分成功分片，失败分片或流提前结束视为错误
pub async fn reason_to_completion(
    tool: &dyn ReasoningTool,
    request: ReasoningRequest,
) -> Result<Value, LlmError> {
    let mut stream = tool.execute(request).await?;
    while let Some(chunk) = stream.next().await {
        if !chunk.success {
            let msg = match chunk.data {
                ChunkData::Message(m) => m,
                ChunkData::Result(v) => v.to_string(),
            };
            return Err(LlmError::Api(msg));
        }
        if !chunk.is_partial {
            return Ok(match chunk.data {
                ChunkData::Result(v) => v,
                ChunkData::Message(m) => extract_json(&m).unwrap_or(Value::String(m)),
            });
        }
    }
    Err(LlmError::InvalidResponse("stream ended without a final result".into()))
}

/// 从模型输出中提取 JSON 对象：优先 ```json 代码块，其次最外层 {...}
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(rest[..end].trim()) {
                return Some(v);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{FailingLlmClient, ScriptedLlmClient};
    use serde_json::json;

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("here:\n```json\n{\"b\": 2}\n```\nthanks"),
            Some(json!({"b": 2}))
        );
        assert_eq!(extract_json("prefix {\"c\": 3} suffix"), Some(json!({"c": 3})));
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_reasoning_stream_partial_then_final() {
        let llm = Arc::new(ScriptedLlmClient::new(r#"{"answer": "ok", "confidence": 0.9}"#));
        let tool = LlmReasoningTool::new(llm);
        let mut stream = tool
            .execute(ReasoningRequest::new("q", ReasoningDepth::Basic))
            .await
            .unwrap();
        let mut partials = 0;
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            if chunk.is_partial {
                partials += 1;
            } else {
                last = Some(chunk);
            }
        }
        assert!(partials >= 1);
        let last = last.unwrap();
        assert!(last.success);
        match last.data {
            ChunkData::Result(v) => assert_eq!(v["answer"], "ok"),
            ChunkData::Message(_) => panic!("expected result"),
        }
    }

    #[tokio::test]
    async fn test_reason_to_completion_propagates_failure() {
        let tool = LlmReasoningTool::new(Arc::new(FailingLlmClient::default()));
        let err = reason_to_completion(&tool, ReasoningRequest::new("q", ReasoningDepth::Expert))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
    }
}
