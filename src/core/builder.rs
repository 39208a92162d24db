//! 平台构建器：进程级依赖容器
//!
//! 所有进程内单例（注册表、协调器、上下文系统、内存管理器等）都在这里构造一次并显式注入。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::{ProtectedKeysCheck, SafetyCheck, UnifiedContextSystem};
use crate::core::{AgentCoordinator, AgentRegistry, MessageBus, TaskScheduler, TaskSupervisor};
use crate::llm::{LlmClient, LlmReasoningTool, MockLlmClient, OpenAiClient, ReasoningTool};
use crate::memory::MemoryManager;
use crate::tools::{
    AnalysisTool, ContextDataSourceProbe, DataSourceProbe, PlaceholderAnalysisTool, SqlGenerationTool, Tool,
    ToolExecutor, ToolRegistry,
};
use crate::tt::{KeywordStrategySelector, StageEngine, StrategySelector, TtController};

/// 受保护、不允许被增量优化改写的上下文键
const PROTECTED_KEYS: [&str; 2] = ["data_source_context", "data_source_id"];

/// 按配置选择 LLM 后端：provider 为 openai 且设置了 OPENAI_API_KEY 时走 OpenAI 兼容端点，否则用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if provider == "openai" => {
            tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
                cfg.llm.temperature,
            ))
        }
        _ => {
            tracing::info!("Using mock LLM (provider = {})", provider);
            Arc::new(MockLlmClient)
        }
    }
}

pub struct PlatformBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    probe: Option<Arc<dyn DataSourceProbe>>,
    selector: Option<Arc<dyn StrategySelector>>,
    safety: Option<Arc<dyn SafetyCheck>>,
    extra_tools: Vec<Arc<dyn Tool>>,
}

impl PlatformBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            probe: None,
            selector: None,
            safety: None,
            extra_tools: Vec::new(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DataSourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn StrategySelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_safety_check(mut self, safety: Arc<dyn SafetyCheck>) -> Self {
        self.safety = Some(safety);
        self
    }

    /// 追加工具；与内置工具同类时替换内置工具
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_tool_registry(&self, reasoning: &Arc<dyn ReasoningTool>) -> ToolRegistry {
        let probe = self
            .probe
            .clone()
            .unwrap_or_else(|| Arc::new(ContextDataSourceProbe));
        let mut registry = ToolRegistry::new();
        registry.register_tool(PlaceholderAnalysisTool::new(Some(Arc::clone(reasoning))));
        registry.register_tool(SqlGenerationTool::new(
            Arc::clone(reasoning),
            probe,
            self.config.sql.clone(),
        ));
        for tool in AnalysisTool::all(Arc::clone(reasoning)) {
            registry.register_tool(tool);
        }
        for tool in &self.extra_tools {
            registry.register(Arc::clone(tool));
        }
        registry
    }

    pub fn build(self) -> Platform {
        let config = self.config.clone();
        let llm = self.llm.clone().unwrap_or_else(|| create_llm_from_config(&config));
        let reasoning: Arc<dyn ReasoningTool> = Arc::new(LlmReasoningTool::new(Arc::clone(&llm)));

        let tools = Arc::new(self.build_tool_registry(&reasoning));
        let scheduler = Arc::new(TaskScheduler::new(config.coordinator.max_concurrent_tools));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&tools),
            Arc::clone(&scheduler),
            config.coordinator.tool_timeout_secs,
        ));
        let selector = self
            .selector
            .clone()
            .unwrap_or_else(|| Arc::new(KeywordStrategySelector));
        let controller = Arc::new(TtController::new(
            StageEngine::new(Arc::clone(&reasoning), config.tt.stage_timeout()),
            selector,
            executor,
            config.tt.compact_keep_messages,
        ));

        let safety = self
            .safety
            .clone()
            .unwrap_or_else(|| Arc::new(ProtectedKeysCheck::new(PROTECTED_KEYS)));
        let context_system = Arc::new(UnifiedContextSystem::new(
            &config.context,
            config.optimization.clone(),
            config.learning.clone(),
            safety,
        ));

        let memory = Arc::new(MemoryManager::new(config.memory.clone()));
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(MessageBus::default());
        let bus_ref = Arc::downgrade(&bus);
        memory.register_purge_hook(Arc::new(move || bus_ref.upgrade().map(|b| b.purge()).unwrap_or(0)));
        let supervisor = Arc::new(TaskSupervisor::new());
        let coordinator = Arc::new(AgentCoordinator::new(
            Arc::clone(&controller),
            Arc::clone(&registry),
            Arc::clone(&context_system),
            Arc::clone(&memory),
            Arc::clone(&bus),
            Arc::clone(&supervisor),
            config.coordinator.clone(),
            config.tt.clone(),
        ));

        tracing::debug!(tools = tools.len(), mode = ?context_system.mode(), "platform built");
        Platform {
            config,
            llm,
            reasoning,
            tools,
            scheduler,
            controller,
            context_system,
            memory,
            registry,
            bus,
            supervisor,
            coordinator,
        }
    }
}

/// 进程级容器：构造一次，按需克隆其中的 Arc
pub struct Platform {
    pub config: AppConfig,
    pub llm: Arc<dyn LlmClient>,
    pub reasoning: Arc<dyn ReasoningTool>,
    pub tools: Arc<ToolRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub controller: Arc<TtController>,
    pub context_system: Arc<UnifiedContextSystem>,
    pub memory: Arc<MemoryManager>,
    pub registry: Arc<AgentRegistry>,
    pub bus: Arc<MessageBus>,
    pub supervisor: Arc<TaskSupervisor>,
    pub coordinator: Arc<AgentCoordinator>,
}

/// 便捷函数：加载配置（失败则用默认值）并创建构建器
pub fn create_platform_builder(config_path: Option<PathBuf>) -> PlatformBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    PlatformBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use crate::tools::ToolKind;

    #[test]
    fn test_default_platform_registers_all_tool_kinds() {
        let platform = PlatformBuilder::new(AppConfig::default()).build();
        assert_eq!(platform.tools.kinds(), ToolKind::ALL.to_vec());
        assert_eq!(platform.scheduler.max_concurrent_tools(), 4);
        assert!(platform.registry.is_empty());
    }

    #[test]
    fn test_memory_tick_purges_bus_lookup_index() {
        let platform = PlatformBuilder::new(AppConfig::default()).build();
        // 超出最近消息环容量且无人持有的消息只剩失效弱引用
        for i in 0..300 {
            platform.bus.publish("test.topic", serde_json::json!(i));
        }
        assert_eq!(platform.memory.monitor_tick(), 44);
        assert_eq!(platform.memory.monitor_tick(), 0);
        assert_eq!(platform.bus.recent(None).len(), 256);
    }

    #[tokio::test]
    async fn test_mock_llm_when_provider_is_mock() {
        // 默认 provider 为 mock，与环境变量无关
        let llm = create_llm_from_config(&AppConfig::default());
        let reply = llm.complete(&[Message::user("hello")]).await.unwrap();
        assert!(!reply.is_empty());
        assert_eq!(llm.token_usage(), (0, 0, 0));
    }
}
