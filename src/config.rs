//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `IAOP__*` 覆盖（双下划线表示嵌套，如 `IAOP__TT__MAX_RECURSION_DEPTH=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::context::IntegrationMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tt: TtSection,
    pub coordinator: CoordinatorSection,
    pub context: ContextSection,
    pub optimization: OptimizationSection,
    pub learning: LearningSection,
    pub memory: MemorySection,
    pub llm: LlmSection,
    pub sql: SqlSection,
}

/// [tt] 段：递归深度、内存阈值、压缩保留条数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtSection {
    pub max_recursion_depth: u32,
    /// context_data + message_history 估算字节数超过此值时压缩历史
    pub memory_threshold_bytes: usize,
    pub compact_keep_messages: usize,
    /// 单个 LLM 阶段等待下一个流式分片的超时（秒），超时即走降级
    pub stage_timeout_secs: u64,
}

impl Default for TtSection {
    fn default() -> Self {
        Self {
            max_recursion_depth: 10,
            memory_threshold_bytes: 1024 * 1024,
            compact_keep_messages: 50,
            stage_timeout_secs: 60,
        }
    }
}

impl TtSection {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.max(1))
    }
}

/// [coordinator] 段：任务超时、工具并发、单工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub default_timeout_secs: u64,
    pub max_concurrent_tools: usize,
    pub tool_timeout_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            max_concurrent_tools: 4,
            tool_timeout_secs: 60,
        }
    }
}

/// [context] 段：统一上下文系统的集成模式与智能优化参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub integration_mode: IntegrationMode,
    pub max_optimization_iterations: usize,
    pub confidence_threshold: f64,
    pub enable_pattern_learning: bool,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            integration_mode: IntegrationMode::Learning,
            max_optimization_iterations: 5,
            confidence_threshold: 0.8,
            enable_pattern_learning: true,
        }
    }
}

/// [optimization] 段：渐进式优化引擎
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizationSection {
    pub max_feedback: usize,
    pub min_feedback_count: usize,
    pub learning_rate: f64,
    pub safety_confidence_threshold: f64,
}

impl Default for OptimizationSection {
    fn default() -> Self {
        Self {
            max_feedback: 1000,
            min_feedback_count: 5,
            learning_rate: 0.1,
            safety_confidence_threshold: 0.7,
        }
    }
}

/// [learning] 段：知识保留窗口与最小使用次数（两者同时不满足才清理）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningSection {
    pub retention_days: i64,
    pub min_usage_count: u32,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            retention_days: 30,
            min_usage_count: 2,
        }
    }
}

/// [memory] 段：内存管理器 LRU 与压力阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub cache_capacity: usize,
    pub max_cache_bytes: usize,
    pub pressure_ratio: f64,
    pub target_ratio: f64,
    pub monitor_interval_secs: u64,
    pub cleanup_workers: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            max_cache_bytes: 64 * 1024 * 1024,
            pressure_ratio: 0.85,
            target_ratio: 0.6,
            monitor_interval_secs: 30,
            cleanup_workers: 2,
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai；openai 需要 OPENAI_API_KEY
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.2,
        }
    }
}

/// [sql] 段：SQL 生成工具的连通性探测与质量阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqlSection {
    pub probe_max_attempts: u32,
    pub probe_backoff_ms: u64,
    pub quality_threshold: f64,
}

impl Default for SqlSection {
    fn default() -> Self {
        Self {
            probe_max_attempts: 3,
            probe_backoff_ms: 1000,
            quality_threshold: 0.7,
        }
    }
}

/// 从 config 目录加载配置，环境变量 IAOP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 IAOP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("IAOP")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.tt.max_recursion_depth, 10);
        assert_eq!(cfg.tt.compact_keep_messages, 50);
        assert_eq!(cfg.sql.probe_max_attempts, 3);
        assert_eq!(cfg.optimization.max_feedback, 1000);
        assert_eq!(cfg.context.integration_mode, IntegrationMode::Learning);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[tt]\nmax_recursion_depth = 4\n\n[context]\nintegration_mode = \"enhanced\"\n\n[sql]\nprobe_backoff_ms = 5"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.tt.max_recursion_depth, 4);
        // 未写的键保留默认值
        assert_eq!(cfg.tt.compact_keep_messages, 50);
        assert_eq!(cfg.context.integration_mode, IntegrationMode::Enhanced);
        assert_eq!(cfg.sql.probe_backoff_ms, 5);
        assert_eq!(cfg.sql.probe_max_attempts, 3);
    }
}
