//! 核心编排层：错误、任务调度与监管、智能体注册表、消息总线、协调器与平台容器

pub mod builder;
pub mod coordinator;
pub mod error;
pub mod message_bus;
pub mod registry;
pub mod supervisor;
pub mod task_scheduler;

pub use builder::{create_llm_from_config, create_platform_builder, Platform, PlatformBuilder};
pub use coordinator::{AgentCoordinator, AgentDescriptor, TaskOutcome, TaskRequest};
pub use error::IaopError;
pub use message_bus::{BusMessage, MessageBus, TOPIC_AGENT_REGISTERED, TOPIC_TASK_FINISHED, TOPIC_TASK_STARTED};
pub use registry::{Agent, AgentRegistration, AgentRegistry};
pub use supervisor::TaskSupervisor;
pub use task_scheduler::TaskScheduler;
