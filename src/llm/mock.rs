//! Mock / 脚本化 / 必然失败的 LLM 客户端（用于测试与本地演示，无需 API）
//!
//! 阶段与工具的提示词带有 `[stage: xxx]` / `[tool: xxx]` 标记，Mock 按标记返回预置 JSON。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::json;

use crate::llm::{LlmClient, LlmError, TokenStream};
use crate::memory::Message;

/// 流式输出时每个分片的字符数
const CHUNK_CHARS: usize = 16;

fn chunked(content: &str) -> Vec<Result<String, LlmError>> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return vec![Ok(String::new())];
    }
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| Ok(c.iter().collect::<String>()))
        .collect()
}

fn prompt_text(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Mock 客户端：按提示词中的阶段/工具标记返回预置 JSON
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn canned(prompt: &str) -> String {
        let value = if prompt.contains("[stage: intent_understanding]") {
            json!({
                "core_intent": "generate statistics for the requested business metric",
                "complexity": "medium",
                "reasoning_type": "analytical",
                "expected_output": "sql_query",
                "confidence": 0.85
            })
        } else if prompt.contains("[stage: context_analysis]") {
            json!({
                "key_elements": ["placeholder_text", "data_source_context"],
                "data_quality": "good",
                "constraints": ["read_only_queries"],
                "missing_information": [],
                "confidence": 0.8
            })
        } else if prompt.contains("[stage: structure_planning]") {
            json!({
                "steps": ["understand placeholder", "generate sql", "validate", "deliver"],
                "required_tools": ["sql_generation"],
                "dependencies": [],
                "risks": ["data source unavailable"],
                "confidence": 0.8
            })
        } else if prompt.contains("[stage: optimization]") {
            json!({
                "improvements": ["add explicit column aliases"],
                "quality_assessment": "good",
                "confidence": 0.8
            })
        } else if prompt.contains("[stage: synthesis]") {
            json!({
                "final_result": "synthesized result",
                "insights": ["result ready for rendering"],
                "quality": "high",
                "confidence": 0.85
            })
        } else if prompt.contains("[tool: sql_generation]") {
            json!({
                "sql_query": "SELECT SUM(amount) AS total_sales FROM sales WHERE sale_date >= DATE_TRUNC('month', CURRENT_DATE - INTERVAL '1 month') AND sale_date < DATE_TRUNC('month', CURRENT_DATE)",
                "business_logic": "sum of sales amount over the previous calendar month",
                "confidence": 0.9
            })
        } else if prompt.contains("[tool: placeholder_analysis]") {
            json!({
                "semantic_type": "statistic",
                "metrics": ["sales_amount"],
                "confidence": 0.85
            })
        } else if prompt.contains("[tool:") {
            json!({
                "summary": "analysis completed",
                "findings": ["stable trend"],
                "confidence": 0.8
            })
        } else {
            json!({ "answer": "ok", "confidence": 0.7 })
        };
        value.to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        Ok(Self::canned(&prompt_text(messages)))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(chunked(&content))))
    }
}

/// 脚本化客户端：按「标记 -> 响应」规则返回，未命中时返回默认响应；可选延迟，统计调用次数
#[derive(Debug)]
pub struct ScriptedLlmClient {
    rules: Vec<(String, String)>,
    default_response: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_response: default_response.into(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 提示词包含 marker 时返回 response（按添加顺序匹配）
    pub fn with_rule(mut self, marker: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((marker.into(), response.into()));
        self
    }

    /// 每次调用前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self, messages: &[Message]) -> String {
        let prompt = prompt_text(messages);
        self.rules
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default_response.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        Ok(self.respond(messages))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(chunked(&content))))
    }
}

/// 总是失败的客户端：用于验证各阶段的降级路径
#[derive(Debug, Default)]
pub struct FailingLlmClient {
    calls: AtomicUsize,
}

impl FailingLlmClient {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FailingLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LlmError::Api("simulated backend failure".to_string()))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, LlmError> {
        self.complete(messages).await?;
        Err(LlmError::Api("simulated backend failure".to_string()))
    }
}
