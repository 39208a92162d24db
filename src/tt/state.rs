//! TT 循环状态：任务上下文、循环状态、阶段与显式调用栈帧

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::memory::{history_bytes, Message};
use crate::tools::ToolRequest;
use crate::tt::heuristics::ImplementationStrategy;

/// 一次 TT 调用的任务上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtContext {
    pub task_id: String,
    pub user_id: String,
    pub task_description: String,
    pub context_data: BTreeMap<String, Value>,
    pub message_history: Vec<Message>,
    pub target_agents: Vec<String>,
    pub timeout_seconds: u64,
}

impl TtContext {
    pub fn new(
        task_id: impl Into<String>,
        user_id: impl Into<String>,
        task_description: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            task_description: task_description.into(),
            context_data: BTreeMap::new(),
            message_history: Vec::new(),
            target_agents: Vec::new(),
            timeout_seconds: 0,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_data.insert(key.into(), value);
        self
    }

    /// context_data 与 message_history 的字节估算
    pub fn estimated_bytes(&self) -> usize {
        let data: usize = self
            .context_data
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        data + history_bytes(&self.message_history)
    }
}

/// 循环状态：turn_counter 在每次递归时严格递增
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtLoopState {
    pub turn_id: String,
    pub task_id: String,
    pub turn_counter: u32,
    /// 历史是否已在内存压力下压缩过
    pub compacted: bool,
    pub is_resuming: bool,
    pub max_recursion_depth: u32,
    /// 字节
    pub memory_threshold: usize,
}

impl TtLoopState {
    pub fn new(task_id: impl Into<String>, max_recursion_depth: u32, memory_threshold: usize) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            turn_counter: 0,
            compacted: false,
            is_resuming: false,
            max_recursion_depth,
            memory_threshold,
        }
    }

    /// 下一轮的状态：计数加一、新 turn_id、标记为续跑
    pub fn increment_turn(&self) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            turn_counter: self.turn_counter + 1,
            is_resuming: true,
            ..self.clone()
        }
    }

    pub fn limit_reached(&self) -> bool {
        self.turn_counter >= self.max_recursion_depth
    }
}

/// 六个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IntentUnderstanding,
    ContextAnalysis,
    StructurePlanning,
    Implementation,
    Optimization,
    Synthesis,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::IntentUnderstanding,
        Stage::ContextAnalysis,
        Stage::StructurePlanning,
        Stage::Implementation,
        Stage::Optimization,
        Stage::Synthesis,
    ];

    /// 1..=6
    pub fn index(&self) -> usize {
        match self {
            Stage::IntentUnderstanding => 1,
            Stage::ContextAnalysis => 2,
            Stage::StructurePlanning => 3,
            Stage::Implementation => 4,
            Stage::Optimization => 5,
            Stage::Synthesis => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::IntentUnderstanding => "intent_understanding",
            Stage::ContextAnalysis => "context_analysis",
            Stage::StructurePlanning => "structure_planning",
            Stage::Implementation => "implementation",
            Stage::Optimization => "optimization",
            Stage::Synthesis => "synthesis",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index()).copied()
    }
}

/// 帧所处阶段
#[derive(Debug, Clone, PartialEq)]
pub enum FramePhase {
    Enter,
    Stage(Stage),
    DispatchTools,
    /// 已压入子帧，等待其结束
    AwaitingChild,
    Finished,
}

/// 显式调用栈中的一帧：对应一次 tt 调用
#[derive(Debug)]
pub struct LoopFrame {
    pub context: TtContext,
    pub loop_state: TtLoopState,
    pub phase: FramePhase,
    pub outputs: HashMap<Stage, Value>,
    pub strategy: Option<ImplementationStrategy>,
    pub pending_tools: Vec<ToolRequest>,
}

impl LoopFrame {
    pub fn new(context: TtContext, loop_state: TtLoopState) -> Self {
        Self {
            context,
            loop_state,
            phase: FramePhase::Enter,
            outputs: HashMap::new(),
            strategy: None,
            pending_tools: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_increment_turn_is_strictly_increasing() {
        let s0 = TtLoopState::new("task", 3, 1024);
        let s1 = s0.increment_turn();
        let s2 = s1.increment_turn();
        assert_eq!(s0.turn_counter, 0);
        assert_eq!(s1.turn_counter, 1);
        assert_eq!(s2.turn_counter, 2);
        assert_ne!(s0.turn_id, s1.turn_id);
        assert!(s1.is_resuming);
        assert_eq!(s2.task_id, "task");
        assert!(!s2.limit_reached());
        assert!(s2.increment_turn().limit_reached());
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::IntentUnderstanding.next(), Some(Stage::ContextAnalysis));
        assert_eq!(Stage::Synthesis.next(), None);
        assert_eq!(Stage::Implementation.index(), 4);
    }

    #[test]
    fn test_estimated_bytes_counts_data_and_history() {
        let mut ctx = TtContext::new("t", "u", "d").with_context("k", json!("vv"));
        let base = ctx.estimated_bytes();
        assert_eq!(base, 1 + 4);
        ctx.message_history.push(Message::user("abc"));
        assert_eq!(ctx.estimated_bytes(), base + 3);
    }
}
