//! 上下文子系统：执行上下文、智能优化、渐进优化、学习增强与统一入口

pub mod execution;
pub mod intelligent;
pub mod learning;
pub mod optimization;
pub mod unified;

pub use execution::{
    is_task_identity_key, ContextEntry, ContextScope, ExecutionContext, ExecutionRecord, TASK_IDENTITY_KEYS,
};
pub use intelligent::{
    assess_quality, detect_inconsistencies, IntelligentContextManager, OptimizationResult, OptimizationTarget,
    QualityBreakdown,
};
pub use learning::{
    infer_domain, AvoidanceRule, ContextEnhancement, ContextPattern, LearningEnhancedContextSystem, Provenance,
};
pub use optimization::{
    classify_feedback, ExecutionSummary, FeedbackKind, IncrementalResult, OptimizationStrategy,
    ProgressiveOptimizationEngine, ProtectedKeysCheck, Recommendation, RecommendationAction, RiskLevel,
    SafetyCheck, UserFeedback,
};
pub use unified::{
    ContextCreation, ContextRequest, IntegrationMode, PerformanceMetrics, PlaceholderContext, PlaceholderSpec,
    UnifiedContextSystem,
};
