//! 消息与消息历史压缩
//!
//! Message 既是 LLM 请求的基本单元，也是 TT 循环中 message_history 的记录单元。
//! 内存压力下历史被压缩为「一条摘要消息 + 最近 N 条」。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 摘要中每条被压缩消息保留的字符数
const SUMMARY_SNIPPET_CHARS: usize = 40;
/// 摘要最多列出的被压缩消息条数
const SUMMARY_MAX_SNIPPETS: usize = 10;

/// 消息历史的字节估算（仅内容长度）
pub fn history_bytes(history: &[Message]) -> usize {
    history.iter().map(|m| m.content.len()).sum()
}

/// 将 history 压缩为「一条合成摘要 system 消息 + 最近 keep 条」。
/// 条数不超过 keep 时不做任何事并返回 None；否则返回被摘要的消息条数。
pub fn compact_history(history: &mut Vec<Message>, keep: usize) -> Option<usize> {
    if history.len() <= keep {
        return None;
    }
    let cut = history.len() - keep;
    let older: Vec<Message> = history.drain(..cut).collect();

    let snippets: Vec<String> = older
        .iter()
        .rev()
        .take(SUMMARY_MAX_SNIPPETS)
        .rev()
        .map(|m| {
            let s: String = m.content.chars().take(SUMMARY_SNIPPET_CHARS).collect();
            format!("- [{:?}] {}", m.role, s)
        })
        .collect();
    let summary = Message::system(format!(
        "Previous {} messages were compacted under memory pressure. Most recent of them:\n{}",
        older.len(),
        snippets.join("\n")
    ));
    history.insert(0, summary);
    Some(older.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_keeps_recent_and_adds_summary() {
        let mut history: Vec<Message> = (0..80).map(|i| Message::assistant(format!("stage output {}", i))).collect();
        let summarized = compact_history(&mut history, 50);
        assert_eq!(summarized, Some(30));
        assert_eq!(history.len(), 51);
        assert_eq!(history[0].role, Role::System);
        assert!(history[0].content.contains("Previous 30 messages"));
        assert_eq!(history[1].content, "stage output 30");
        assert_eq!(history[50].content, "stage output 79");
    }

    #[test]
    fn test_compact_noop_when_short() {
        let mut history = vec![Message::user("hi")];
        assert_eq!(compact_history(&mut history, 50), None);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_history_bytes() {
        let history = vec![Message::user("abc"), Message::assistant("de")];
        assert_eq!(history_bytes(&history), 5);
    }
}
