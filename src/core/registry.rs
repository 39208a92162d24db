//! 智能体注册表：按能力分桶、按优先级排序、支持智能体链

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::core::IaopError;

/// 可注册的智能体
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn handle(&self, input: Value, context: &mut ExecutionContext) -> Result<Value, IaopError>;
}

#[derive(Clone)]
pub struct AgentRegistration {
    pub agent: Arc<dyn Agent>,
    pub priority: i32,
    pub capabilities: Vec<String>,
    /// 必须出现在上下文中且非 null 的键
    pub requirements: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for AgentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistration")
            .field("name", &self.agent.name())
            .field("priority", &self.priority)
            .field("capabilities", &self.capabilities)
            .field("requirements", &self.requirements)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRegistration>,
    by_capability: HashMap<String, BTreeSet<String>>,
    chains: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn detach(&mut self, name: &str) -> Option<AgentRegistration> {
        let old = self.agents.remove(name)?;
        for cap in &old.capabilities {
            if let Some(bucket) = self.by_capability.get_mut(cap) {
                bucket.remove(name);
                if bucket.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
        Some(old)
    }

    /// 优先级降序，同优先级按名称
    fn sorted(&self, names: impl Iterator<Item = String>) -> Vec<String> {
        let mut regs: Vec<(&String, i32)> = Vec::new();
        let names: Vec<String> = names.collect();
        for name in &names {
            if let Some(reg) = self.agents.get(name) {
                regs.push((name, reg.priority));
            }
        }
        regs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        regs.into_iter().map(|(n, _)| n.clone()).collect()
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册智能体；同名重复注册覆盖旧条目
    pub fn register_agent(
        &self,
        agent: Arc<dyn Agent>,
        priority: i32,
        capabilities: Vec<String>,
        requirements: Vec<String>,
    ) {
        let name = agent.name().to_string();
        let mut state = self.state.write();
        if state.detach(&name).is_some() {
            tracing::debug!(agent = %name, "agent re-registered, previous entry replaced");
        }
        for cap in &capabilities {
            state
                .by_capability
                .entry(cap.clone())
                .or_default()
                .insert(name.clone());
        }
        state.agents.insert(
            name,
            AgentRegistration {
                agent,
                priority,
                capabilities,
                requirements,
                registered_at: Utc::now(),
            },
        );
    }

    /// 注销：同时从所有能力桶与链中移除
    pub fn unregister_agent(&self, name: &str) -> bool {
        let mut state = self.state.write();
        if state.detach(name).is_none() {
            return false;
        }
        for chain in state.chains.values_mut() {
            chain.retain(|n| n != name);
        }
        state.chains.retain(|_, chain| !chain.is_empty());
        true
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.state.read().agents.get(name).map(|r| Arc::clone(&r.agent))
    }

    pub fn registration(&self, name: &str) -> Option<AgentRegistration> {
        self.state.read().agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().agents.contains_key(name)
    }

    /// 具备该能力的智能体名，优先级降序
    pub fn agent_names_by_capability(&self, capability: &str) -> Vec<String> {
        let state = self.state.read();
        match state.by_capability.get(capability) {
            Some(bucket) => state.sorted(bucket.iter().cloned()),
            None => Vec::new(),
        }
    }

    pub fn get_agents_by_capability(&self, capability: &str) -> Vec<Arc<dyn Agent>> {
        let names = self.agent_names_by_capability(capability);
        let state = self.state.read();
        names
            .iter()
            .filter_map(|n| state.agents.get(n).map(|r| Arc::clone(&r.agent)))
            .collect()
    }

    /// 所有声明的必需键都存在且非 null 时为 true；未注册的智能体为 false
    pub fn can_handle_task(&self, name: &str, context: &BTreeMap<String, Value>) -> bool {
        let state = self.state.read();
        let Some(reg) = state.agents.get(name) else {
            return false;
        };
        reg.requirements
            .iter()
            .all(|k| context.get(k).map(|v| !v.is_null()).unwrap_or(false))
    }

    /// 注册有序的智能体链；链中每个智能体都必须已注册
    pub fn register_agent_chain(&self, chain: &str, agents: Vec<String>) -> Result<(), IaopError> {
        if agents.is_empty() {
            return Err(IaopError::InvalidChain {
                chain: chain.to_string(),
                reason: "chain is empty".to_string(),
            });
        }
        let mut state = self.state.write();
        if let Some(missing) = agents.iter().find(|a| !state.agents.contains_key(*a)) {
            return Err(IaopError::InvalidChain {
                chain: chain.to_string(),
                reason: format!("agent '{missing}' is not registered"),
            });
        }
        state.chains.insert(chain.to_string(), agents);
        Ok(())
    }

    pub fn get_chain(&self, chain: &str) -> Option<Vec<String>> {
        self.state.read().chains.get(chain).cloned()
    }

    /// 同时具备全部所需能力且能处理该上下文的智能体，优先级降序
    pub fn find_suitable_agents(&self, required_capabilities: &[&str], context: &BTreeMap<String, Value>) -> Vec<String> {
        let candidates: Vec<String> = {
            let state = self.state.read();
            let matching = state
                .agents
                .iter()
                .filter(|(_, reg)| {
                    required_capabilities
                        .iter()
                        .all(|cap| reg.capabilities.iter().any(|c| c == cap))
                })
                .map(|(name, _)| name.clone());
            state.sorted(matching)
        };
        candidates
            .into_iter()
            .filter(|name| self.can_handle_task(name, context))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
