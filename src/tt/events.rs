//! TT 循环事件：循环对外报告进度与结果的唯一通道

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtEventKind {
    /// 一轮开始
    TurnStart,
    /// UI 状态（阶段进度）
    UiStateUpdate,
    StageStart,
    StageComplete,
    /// 阶段走了降级路径
    StageFallback,
    LlmCallStart,
    /// 流式增量
    LlmStreamDelta,
    LlmCallComplete,
    LlmCallError,
    ToolExecutionStart,
    /// 单个工具结果
    ToolResult,
    ToolExecutionError,
    /// 批次完成（带成功子集与计数）
    ToolExecutionComplete,
    /// 工具宣告完成，跳过优化与综合阶段
    EarlyTermination,
    RecursionStart,
    RecursionComplete,
    /// 内存压力下压缩了消息历史
    MemoryCompaction,
    TaskComplete,
    SystemError,
    /// 取消（总是紧跟一个 system_error）
    Cancelled,
}

impl TtEventKind {
    /// 是否为终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, TtEventKind::TaskComplete | TtEventKind::SystemError)
    }
}

/// 不可变事件记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtEvent {
    #[serde(rename = "type")]
    pub kind: TtEventKind,
    pub uuid: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub turn_id: String,
    pub turn_counter: u32,
}

impl TtEvent {
    pub fn new(kind: TtEventKind, data: Value, turn_id: &str, turn_counter: u32) -> Self {
        Self {
            kind,
            uuid: Uuid::new_v4(),
            timestamp: Utc::now(),
            data,
            turn_id: turn_id.to_string(),
            turn_counter,
        }
    }

    /// task_complete 事件的 success 字段；其他事件为 None
    pub fn success(&self) -> Option<bool> {
        match self.kind {
            TtEventKind::TaskComplete => self.data.get("success").and_then(Value::as_bool),
            _ => None,
        }
    }
}
