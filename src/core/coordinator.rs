//! 智能体协调器：任务入口。驱动 TT 事件流、执行超时、清理任务登记，并把结果折叠为 TaskOutcome
//!
//! execute_task 从不返回 Err：任何失败都体现在 TaskOutcome.success / error 中。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{CoordinatorSection, TtSection};
use crate::context::{
    ContextEnhancement, ContextRequest, ExecutionContext, ExecutionRecord, ExecutionSummary, UnifiedContextSystem,
};
use crate::core::message_bus::{MessageBus, TOPIC_AGENT_REGISTERED, TOPIC_TASK_FINISHED, TOPIC_TASK_STARTED};
use crate::core::registry::{Agent, AgentRegistry};
use crate::core::{IaopError, TaskSupervisor};
use crate::memory::{MemoryManager, Message};
use crate::tt::{classify_goal, TtContext, TtController, TtEvent, TtEventKind, TtLoopState};

const ARCHITECTURE: &str = "tt_controller";

/// 任务请求
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub description: String,
    pub context: BTreeMap<String, Value>,
    pub target_agents: Vec<String>,
    /// 缺省时使用 coordinator.default_timeout_secs
    pub timeout_seconds: Option<u64>,
    pub user_id: String,
    /// 是否在结果中附带全部事件
    pub include_events: bool,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            user_id: "anonymous".to_string(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_target_agents(mut self, agents: Vec<String>) -> Self {
        self.target_agents = agents;
        self
    }

    pub fn with_events(mut self) -> Self {
        self.include_events = true;
        self
    }
}

/// 任务结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub task_id: String,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub llm_interactions: usize,
    pub architecture: String,
    pub events_processed: usize,
    /// 秒
    pub execution_time: f64,
    pub target_agents: Vec<String>,
    pub early_termination: bool,
    /// 预处理补全的上下文键及其来源（推断或已学模式）
    pub context_enhancements: Vec<ContextEnhancement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<TtEvent>>,
}

/// register_agent 登记的描述
#[derive(Debug, Clone, Serialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub capabilities: Vec<String>,
    pub groups: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// 任务结束（含提前返回与 panic 展开）时释放监管登记
struct TaskGuard<'a> {
    supervisor: &'a TaskSupervisor,
    task_id: String,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.release(&self.task_id);
    }
}

pub struct AgentCoordinator {
    controller: Arc<TtController>,
    registry: Arc<AgentRegistry>,
    context_system: Arc<UnifiedContextSystem>,
    memory: Arc<MemoryManager>,
    bus: Arc<MessageBus>,
    supervisor: Arc<TaskSupervisor>,
    config: CoordinatorSection,
    tt_config: TtSection,
    descriptors: RwLock<HashMap<String, AgentDescriptor>>,
    groups: RwLock<HashMap<String, BTreeSet<String>>>,
    running: AtomicBool,
}

impl AgentCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: Arc<TtController>,
        registry: Arc<AgentRegistry>,
        context_system: Arc<UnifiedContextSystem>,
        memory: Arc<MemoryManager>,
        bus: Arc<MessageBus>,
        supervisor: Arc<TaskSupervisor>,
        config: CoordinatorSection,
        tt_config: TtSection,
    ) -> Self {
        Self {
            controller,
            registry,
            context_system,
            memory,
            bus,
            supervisor,
            config,
            tt_config,
            descriptors: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.supervisor.reset();
        self.memory.start_monitor();
        tracing::info!(
            agents = self.registry.len(),
            mode = ?self.context_system.mode(),
            "coordinator started"
        );
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let active = self.supervisor.active_tasks();
        self.supervisor.cancel_all();
        self.memory.stop_monitor();
        tracing::info!(cancelled_tasks = active.len(), "coordinator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn context_system(&self) -> &Arc<UnifiedContextSystem> {
        &self.context_system
    }

    /// 登记智能体描述与分组；id 为空时拒绝
    pub fn register_agent(&self, id: &str, capabilities: &[&str], groups: &[&str]) -> bool {
        if id.trim().is_empty() {
            tracing::warn!("rejected agent registration with empty id");
            return false;
        }
        let descriptor = AgentDescriptor {
            id: id.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            registered_at: Utc::now(),
        };
        {
            let mut all = self.groups.write();
            for members in all.values_mut() {
                members.remove(id);
            }
            for group in groups {
                all.entry(group.to_string()).or_default().insert(id.to_string());
            }
            all.retain(|_, members| !members.is_empty());
        }
        self.bus.publish(
            TOPIC_AGENT_REGISTERED,
            json!({"agent_id": id, "capabilities": descriptor.capabilities, "groups": descriptor.groups}),
        );
        self.descriptors.write().insert(id.to_string(), descriptor);
        tracing::info!(agent = %id, "agent registered");
        true
    }

    /// 注册可执行的智能体实例（同时登记描述）
    pub fn register_agent_instance(
        &self,
        agent: Arc<dyn Agent>,
        priority: i32,
        capabilities: &[&str],
        requirements: &[&str],
    ) -> bool {
        let name = agent.name().to_string();
        self.registry.register_agent(
            agent,
            priority,
            capabilities.iter().map(|c| c.to_string()).collect(),
            requirements.iter().map(|r| r.to_string()).collect(),
        );
        self.register_agent(&name, capabilities, &[])
    }

    pub fn agent_descriptor(&self, id: &str) -> Option<AgentDescriptor> {
        self.descriptors.read().get(id).cloned()
    }

    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn is_known_agent(&self, id: &str) -> bool {
        self.registry.contains(id) || self.descriptors.read().contains_key(id)
    }

    /// 显式目标过滤为已知智能体；为空时按任务目标的能力从注册表选取
    fn resolve_target_agents(&self, request: &TaskRequest) -> Vec<String> {
        let explicit: Vec<String> = request
            .target_agents
            .iter()
            .filter(|a| self.is_known_agent(a))
            .cloned()
            .collect();
        if !explicit.is_empty() {
            return explicit;
        }
        let keys: Vec<&str> = request.context.keys().map(String::as_str).collect();
        let capability = classify_goal(&request.description, &keys).capability();
        let mut agents = self.registry.agent_names_by_capability(capability);
        let mut described: Vec<String> = self
            .descriptors
            .read()
            .values()
            .filter(|d| d.capabilities.iter().any(|c| c == capability) && !agents.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();
        described.sort();
        agents.extend(described);
        agents
    }

    /// 顺序执行已注册的智能体链，前者输出作为后者输入
    pub async fn run_agent_chain(
        &self,
        chain: &str,
        input: Value,
        context: &mut ExecutionContext,
    ) -> Result<Value, IaopError> {
        let members = self.registry.get_chain(chain).ok_or_else(|| IaopError::InvalidChain {
            chain: chain.to_string(),
            reason: "chain is not registered".to_string(),
        })?;
        let mut current = input;
        for name in members {
            let agent = self
                .registry
                .get_agent(&name)
                .ok_or_else(|| IaopError::AgentNotFound(name.clone()))?;
            match agent.handle(current, context).await {
                Ok(output) => {
                    context.record_execution(ExecutionRecord::new(&name, chain, true, Value::Null));
                    current = output;
                }
                Err(e) => {
                    context.record_execution(ExecutionRecord::new(&name, chain, false, json!(e.to_string())));
                    context.push_error(format!("{name}: {e}"));
                    return Err(e);
                }
            }
        }
        Ok(current)
    }

    pub fn cancel_task(&self, task_id: &str) -> bool {
        self.supervisor.cancel_task(task_id)
    }

    pub fn active_tasks(&self) -> Vec<String> {
        self.supervisor.active_tasks()
    }

    /// 执行任务：上下文预处理 → 驱动 TT 事件流（带超时）→ 折叠为结果 → 记录反馈
    pub async fn execute_task(&self, request: TaskRequest) -> TaskOutcome {
        let started = Instant::now();
        let task_id = Uuid::new_v4().to_string();
        let cancel = self.supervisor.register(&task_id);
        let _guard = TaskGuard {
            supervisor: &self.supervisor,
            task_id: task_id.clone(),
        };
        let timeout_secs = request.timeout_seconds.unwrap_or(self.config.default_timeout_secs);

        tracing::info!(task_id = %task_id, user_id = %request.user_id, timeout_secs, "task started");
        self.bus.publish(
            TOPIC_TASK_STARTED,
            json!({"task_id": task_id, "description": request.description}),
        );

        let creation = self.context_system.create_execution_context(&ContextRequest {
            session_id: task_id.clone(),
            user_id: request.user_id.clone(),
            task_id: task_id.clone(),
            task_description: request.description.clone(),
            initial: request.context.clone(),
            ..Default::default()
        });
        // 只补充，不覆盖调用方给出的值
        let mut context_data = request.context.clone();
        for (key, value) in creation.context.to_value_map() {
            context_data.entry(key).or_insert(value);
        }
        for e in &creation.enhancements {
            tracing::debug!(
                task_id = %task_id,
                key = %e.key,
                provenance = e.provenance.as_str(),
                source = %e.source,
                "context enhanced"
            );
        }
        for warning in &creation.warnings {
            tracing::debug!(task_id = %task_id, warning = %warning, "context warning");
        }

        let target_agents = self.resolve_target_agents(&request);
        let mut tt_context = TtContext::new(&task_id, &request.user_id, &request.description);
        tt_context.context_data = context_data;
        tt_context.target_agents = target_agents.clone();
        tt_context.timeout_seconds = timeout_secs;
        tt_context.message_history.push(Message::user(&request.description));
        let loop_state = TtLoopState::new(
            &task_id,
            self.tt_config.max_recursion_depth,
            self.tt_config.memory_threshold_bytes,
        );

        let mut events: Vec<TtEvent> = Vec::new();
        let mut timed_out = false;
        {
            let mut stream = self.controller.tt(tt_context, loop_state, cancel.clone());
            let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut deadline => {
                        timed_out = true;
                        cancel.cancel();
                        break;
                    }
                    next = stream.next() => match next {
                        Some(event) => events.push(event),
                        None => break,
                    },
                }
            }
        }

        if timed_out {
            let err = IaopError::TaskTimeout(timeout_secs);
            tracing::warn!(task_id = %task_id, timeout_secs, "task timed out, cancelled");
            let (turn_id, turn_counter) = events
                .last()
                .map(|e| (e.turn_id.clone(), e.turn_counter))
                .unwrap_or_default();
            events.push(TtEvent::new(
                TtEventKind::SystemError,
                json!({"error_kind": err.kind(), "error": err.to_string(), "task_id": task_id}),
                &turn_id,
                turn_counter,
            ));
        }

        let llm_interactions = events.iter().filter(|e| e.kind == TtEventKind::LlmCallStart).count();
        let terminal = events.iter().rev().find(|e| e.kind.is_terminal());
        let (success, result, error, early_termination) = match terminal {
            Some(e) if e.success() == Some(true) => (
                true,
                e.data.get("result").cloned().unwrap_or(Value::Null),
                None,
                e.data["early_termination"].as_bool().unwrap_or(false),
            ),
            Some(e) => {
                let error = e.data["error"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| "task failed".to_string());
                (
                    false,
                    e.data.get("result").cloned().unwrap_or(Value::Null),
                    Some(error),
                    e.data["early_termination"].as_bool().unwrap_or(false),
                )
            }
            None => (false, Value::Null, Some("task ended without a completion event".to_string()), false),
        };
        let execution_time = started.elapsed().as_secs_f64();

        if success {
            self.memory.put(
                format!("task_result:{task_id}"),
                json!({"description": request.description, "result": result}),
            );
        }
        let confidence = result
            .get("confidence")
            .and_then(Value::as_f64)
            .or_else(|| terminal.and_then(|e| e.data["confidence"].as_f64()))
            .unwrap_or(if success { 0.5 } else { 0.0 });
        self.context_system.record_execution_feedback(
            &request.description,
            &creation.context,
            &ExecutionSummary {
                success,
                confidence,
                execution_time,
                error: error.clone(),
            },
            None,
        );

        tracing::info!(
            task_id = %task_id,
            success,
            events = events.len(),
            llm_interactions,
            early_termination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
        self.bus.publish(
            TOPIC_TASK_FINISHED,
            json!({"task_id": task_id, "success": success, "error": error}),
        );

        TaskOutcome {
            success,
            task_id,
            result,
            error,
            llm_interactions,
            architecture: ARCHITECTURE.to_string(),
            events_processed: events.len(),
            execution_time,
            target_agents,
            early_termination,
            context_enhancements: creation.enhancements,
            events: request.include_events.then_some(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlatformBuilder;
    use crate::config::AppConfig;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl Agent for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        async fn handle(&self, input: Value, _context: &mut ExecutionContext) -> Result<Value, IaopError> {
            Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
        }
    }

    struct Exclaim;

    #[async_trait]
    impl Agent for Exclaim {
        fn name(&self) -> &str {
            "exclaim"
        }
        async fn handle(&self, input: Value, _context: &mut ExecutionContext) -> Result<Value, IaopError> {
            Ok(json!(format!("{}!", input.as_str().unwrap_or_default())))
        }
    }

    #[tokio::test]
    async fn test_register_agent_and_groups() {
        let platform = PlatformBuilder::new(AppConfig::default()).build();
        let coord = &platform.coordinator;
        assert!(!coord.register_agent("  ", &["x"], &[]));
        assert!(coord.register_agent("sql-1", &["sql_generation"], &["data"]));
        assert!(coord.register_agent("sql-2", &["sql_generation"], &["data"]));
        assert_eq!(coord.group_members("data"), vec!["sql-1", "sql-2"]);
        assert!(coord.register_agent("sql-2", &["sql_generation"], &["other"]));
        assert_eq!(coord.group_members("data"), vec!["sql-1"]);
        assert_eq!(platform.bus.recent(Some(TOPIC_AGENT_REGISTERED)).len(), 3);
    }

    #[tokio::test]
    async fn test_run_agent_chain() {
        let platform = PlatformBuilder::new(AppConfig::default()).build();
        let coord = &platform.coordinator;
        coord.register_agent_instance(Arc::new(Upper), 10, &["text"], &[]);
        coord.register_agent_instance(Arc::new(Exclaim), 5, &["text"], &[]);
        coord
            .registry()
            .register_agent_chain("shout", vec!["upper".into(), "exclaim".into()])
            .unwrap();
        let mut ctx = ExecutionContext::new("s", "u", "t");
        let out = coord.run_agent_chain("shout", json!("hi"), &mut ctx).await.unwrap();
        assert_eq!(out, json!("HI!"));
        assert_eq!(ctx.execution_history().len(), 2);
        assert!(coord.run_agent_chain("missing", json!("x"), &mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_task_releases_bookkeeping_and_caches_result() {
        let platform = PlatformBuilder::new(AppConfig::default()).build();
        let coord = &platform.coordinator;
        coord.start();
        coord.register_agent("sql-agent", &["sql_generation"], &[]);
        let outcome = coord
            .execute_task(
                TaskRequest::new("生成上月销售额统计")
                    .with_context("placeholder_text", json!("上月销售额"))
                    .with_context("data_source_context", json!({"id": "ds-1", "name": "sales_db"})),
            )
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.architecture, "tt_controller");
        assert_eq!(outcome.target_agents, vec!["sql-agent"]);
        assert!(outcome.events.is_none());
        assert!(outcome.events_processed > 0);
        assert!(coord.active_tasks().is_empty());
        assert!(platform.memory.get(&format!("task_result:{}", outcome.task_id)).is_some());
        assert_eq!(platform.context_system.metrics().total_executions, 1);
        coord.stop();
        assert!(!coord.is_running());
    }
}
