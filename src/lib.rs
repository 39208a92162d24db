//! IAOP - 智能体编排平台核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 订阅器初始化
//! - **core**: 错误、任务调度与监管、智能体注册表、消息总线、协调器与平台容器
//! - **memory**: 消息历史与压缩、中文分词、内存管理器（LRU + 弱引用缓存）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、推理工具
//! - **tools**: 类型化工具、注册表与并行隔离执行器
//! - **tt**: 六阶段 TT 主控循环与事件流
//! - **context**: 执行上下文、智能优化、渐进优化、学习增强与统一入口

pub mod config;
pub mod context;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod tt;

pub use crate::core::{AgentCoordinator, IaopError, Platform, PlatformBuilder, TaskOutcome, TaskRequest};
pub use crate::tt::{TtController, TtEvent, TtEventKind};
