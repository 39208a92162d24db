//! 执行上下文：按会话持有的键值工作集（不持久化）

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 超过此条数时执行历史轮转
const HISTORY_LIMIT: usize = 100;
const HISTORY_KEEP: usize = 50;

/// 标识单个任务的键：只属于发起它的任务，不进入跨任务学习
pub const TASK_IDENTITY_KEYS: [&str; 9] = [
    "placeholder_text",
    "placeholder_id",
    "placeholder_type",
    "depends_on",
    "data_source_context",
    "data_source_id",
    "table_name",
    "time_range",
    "tool_results",
];

pub fn is_task_identity_key(key: &str) -> bool {
    TASK_IDENTITY_KEYS.contains(&key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Session,
    Task,
    Request,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub value: Value,
    pub scope: ContextScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

impl ContextEntry {
    pub fn new(value: Value, scope: ContextScope) -> Self {
        let now = Utc::now();
        Self {
            value,
            scope,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// 已被降权（低相关度）的条目不参与相关度评分
    pub fn is_deprioritized(&self) -> bool {
        self.metadata
            .get("deprioritized")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// 一条执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub actor: String,
    pub action: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

impl ExecutionRecord {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, success: bool, details: Value) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            success,
            timestamp: Utc::now(),
            details,
        }
    }
}

/// 会话级执行上下文。键唯一；重复 set 原地更新值与时间戳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub session_id: String,
    pub user_id: String,
    pub task_id: String,
    entries: BTreeMap<String, ContextEntry>,
    execution_history: Vec<ExecutionRecord>,
    error_stack: Vec<String>,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            task_id: task_id.into(),
            entries: BTreeMap::new(),
            execution_history: Vec::new(),
            error_stack: Vec::new(),
        }
    }

    /// 以同一作用域批量写入
    pub fn with_values<'a>(
        mut self,
        values: impl IntoIterator<Item = (&'a String, &'a Value)>,
        scope: ContextScope,
    ) -> Self {
        for (k, v) in values {
            self.set_context(k.clone(), v.clone(), scope);
        }
        self
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: Value, scope: ContextScope) {
        let key = key.into();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                entry.scope = scope;
                entry.updated_at = Utc::now();
            }
            None => {
                self.entries.insert(key, ContextEntry::new(value, scope));
            }
        }
    }

    /// 写入并附带元数据（如 provenance、confidence）
    pub fn set_with_metadata(
        &mut self,
        key: impl Into<String>,
        value: Value,
        scope: ContextScope,
        metadata: BTreeMap<String, Value>,
    ) {
        let key = key.into();
        self.set_context(key.clone(), value, scope);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.metadata.extend(metadata);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&ContextEntry> {
        self.entries.get(key)
    }

    pub fn entry_mut(&mut self, key: &str) -> Option<&mut ContextEntry> {
        self.entries.get_mut(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, ContextEntry> {
        &self.entries
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 键存在且值非 null
    pub fn has_value(&self, key: &str) -> bool {
        self.get(key).map(|v| !v.is_null()).unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_execution(&mut self, record: ExecutionRecord) {
        self.execution_history.push(record);
        if self.execution_history.len() > HISTORY_LIMIT {
            let cut = self.execution_history.len() - HISTORY_KEEP;
            self.execution_history.drain(..cut);
        }
    }

    pub fn execution_history(&self) -> &[ExecutionRecord] {
        &self.execution_history
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.error_stack.push(error.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.error_stack
    }

    /// 扁平的键值视图
    pub fn to_value_map(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_same_key_keeps_single_entry() {
        let mut ctx = ExecutionContext::new("s", "u", "t");
        for i in 0..10 {
            ctx.set_context("time_range", json!(format!("v{i}")), ContextScope::Task);
        }
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get("time_range"), Some(&json!("v9")));
        let entry = ctx.entry("time_range").unwrap();
        assert!(entry.updated_at >= entry.created_at);
    }

    #[test]
    fn test_history_rotation() {
        let mut ctx = ExecutionContext::new("s", "u", "t");
        for i in 0..101 {
            ctx.record_execution(ExecutionRecord::new("agent", format!("step {i}"), true, Value::Null));
        }
        assert_eq!(ctx.execution_history().len(), 50);
        assert_eq!(ctx.execution_history()[49].action, "step 100");
    }

    #[test]
    fn test_has_value_ignores_null() {
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("a", Value::Null, ContextScope::Request);
        assert!(ctx.contains("a"));
        assert!(!ctx.has_value("a"));
        ctx.push_error("boom");
        assert_eq!(ctx.errors(), ["boom".to_string()]);
    }
}
