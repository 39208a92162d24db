//! 统一上下文系统：按集成模式组合智能优化、渐进优化与学习增强，对外三个入口

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{ContextSection, LearningSection, OptimizationSection};
use crate::context::execution::{ContextScope, ExecutionContext, ExecutionRecord};
use crate::context::intelligent::{IntelligentContextManager, OptimizationResult, OptimizationTarget};
use crate::context::learning::{ContextEnhancement, LearningEnhancedContextSystem};
use crate::context::optimization::{
    ExecutionSummary, FeedbackKind, IncrementalResult, ProgressiveOptimizationEngine, SafetyCheck, UserFeedback,
};
use crate::core::IaopError;
use crate::tools::{infer_time_range, parse_placeholders, ParsedPlaceholder};
use crate::tt::classify_goal;

const METRICS_WINDOW: usize = 100;

/// 集成模式，后者包含前者的全部能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    Basic,
    Enhanced,
    Intelligent,
    Learning,
}

impl IntegrationMode {
    pub fn uses_intelligent(&self) -> bool {
        *self >= IntegrationMode::Enhanced
    }

    pub fn uses_progressive(&self) -> bool {
        *self >= IntegrationMode::Intelligent
    }

    pub fn uses_learning(&self) -> bool {
        *self >= IntegrationMode::Learning
    }
}

/// create_execution_context 的输入
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub session_id: String,
    pub user_id: String,
    pub task_id: String,
    pub task_description: String,
    pub initial: BTreeMap<String, Value>,
    pub required_keys: Vec<String>,
    pub hints: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextCreation {
    pub context: ExecutionContext,
    pub mode: IntegrationMode,
    pub target_type: String,
    pub enhancements: Vec<ContextEnhancement>,
    pub optimization: Option<OptimizationResult>,
    pub incremental: Option<IncrementalResult>,
    pub warnings: Vec<String>,
}

/// 多占位符输入；depends_on 为其他占位符的 id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceholderContext {
    pub placeholder_id: String,
    /// 拓扑序中的位置
    pub order: usize,
    pub dependencies: Vec<String>,
    pub parsed: Vec<ParsedPlaceholder>,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub window: usize,
    pub success_rate: f64,
    pub average_confidence: f64,
    /// 秒
    pub average_latency: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackOutcome {
    pub kind: Option<FeedbackKind>,
    pub pattern_id: Option<String>,
    pub avoidance_rule_id: Option<String>,
    pub metrics: PerformanceMetrics,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    successful: u64,
    recent: VecDeque<(bool, f64, f64)>,
}

impl MetricsState {
    fn record(&mut self, success: bool, confidence: f64, latency: f64) {
        self.total += 1;
        if success {
            self.successful += 1;
        }
        self.recent.push_back((success, confidence, latency));
        while self.recent.len() > METRICS_WINDOW {
            self.recent.pop_front();
        }
    }

    fn snapshot(&self) -> PerformanceMetrics {
        let n = self.recent.len();
        let mean = |f: fn(&(bool, f64, f64)) -> f64| {
            if n == 0 {
                0.0
            } else {
                self.recent.iter().map(f).sum::<f64>() / n as f64
            }
        };
        PerformanceMetrics {
            total_executions: self.total,
            successful_executions: self.successful,
            window: n,
            success_rate: mean(|r| if r.0 { 1.0 } else { 0.0 }),
            average_confidence: mean(|r| r.1),
            average_latency: mean(|r| r.2),
        }
    }
}

pub struct UnifiedContextSystem {
    mode: IntegrationMode,
    intelligent: IntelligentContextManager,
    progressive: ProgressiveOptimizationEngine,
    learning: LearningEnhancedContextSystem,
    metrics: Mutex<MetricsState>,
}

impl UnifiedContextSystem {
    pub fn new(
        context: &ContextSection,
        optimization: OptimizationSection,
        learning: LearningSection,
        safety: Arc<dyn SafetyCheck>,
    ) -> Self {
        Self {
            mode: context.integration_mode,
            intelligent: IntelligentContextManager::new(context),
            progressive: ProgressiveOptimizationEngine::new(optimization, safety),
            learning: LearningEnhancedContextSystem::new(learning),
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    pub fn mode(&self) -> IntegrationMode {
        self.mode
    }

    pub fn progressive(&self) -> &ProgressiveOptimizationEngine {
        &self.progressive
    }

    pub fn learning(&self) -> &LearningEnhancedContextSystem {
        &self.learning
    }

    pub fn intelligent(&self) -> &IntelligentContextManager {
        &self.intelligent
    }

    /// 任务目标类型（与策略选择使用同一分类）
    pub fn target_type(task: &str, initial: &BTreeMap<String, Value>) -> String {
        let keys: Vec<&str> = initial.keys().map(String::as_str).collect();
        classify_goal(task, &keys).as_str().to_string()
    }

    /// 新建执行上下文，并按模式依次做学习预填、智能优化、增量优化
    pub fn create_execution_context(&self, request: &ContextRequest) -> ContextCreation {
        let mut context = ExecutionContext::new(&request.session_id, &request.user_id, &request.task_id)
            .with_values(request.initial.iter(), ContextScope::Task);
        let target_type = Self::target_type(&request.task_description, &request.initial);
        let mut enhancements = Vec::new();
        let mut warnings = Vec::new();
        let mut optimization = None;
        let mut incremental = None;

        if self.mode.uses_learning() {
            enhancements = self.learning.enhance_context(&request.task_description, &mut context);
            warnings.extend(
                self.learning
                    .avoidance_warnings(&request.task_description, &context)
                    .into_iter()
                    .map(|r| format!("{} (previously: {})", r.recommendation, r.error)),
            );
        }

        if self.mode.uses_intelligent() {
            let mut target = OptimizationTarget::new(&target_type, &request.task_description);
            target.required_keys = request.required_keys.clone();
            let result = self
                .intelligent
                .optimize_execution_context(&context, &target, &request.hints);
            context = result.context.clone();
            if let Some(analysis) = &result.error_analysis {
                warnings.push(analysis.clone());
            }
            optimization = Some(result);
        }

        if self.mode.uses_progressive() {
            let recs = self.progressive.generate_recommendations(&target_type, &context);
            if !recs.is_empty() {
                let result = self.progressive.apply_optimization_incrementally(&context, recs);
                context = result.context.clone();
                incremental = Some(result);
            }
        }

        context.record_execution(ExecutionRecord::new(
            "unified_context",
            "create_execution_context",
            true,
            json!({"mode": self.mode, "enhancements": enhancements.len()}),
        ));
        tracing::debug!(
            task_id = %request.task_id,
            mode = ?self.mode,
            keys = context.len(),
            enhancements = enhancements.len(),
            "execution context created"
        );

        ContextCreation {
            context,
            mode: self.mode,
            target_type,
            enhancements,
            optimization,
            incremental,
            warnings,
        }
    }

    /// 按依赖拓扑序为每个占位符派生上下文；依赖 id 写入各自上下文
    pub fn manage_multi_placeholder_context(
        &self,
        base: &ExecutionContext,
        placeholders: &[PlaceholderSpec],
    ) -> Result<Vec<PlaceholderContext>, IaopError> {
        let order = topological_order(placeholders)?;
        let by_id: HashMap<&str, &PlaceholderSpec> = placeholders.iter().map(|p| (p.id.as_str(), p)).collect();

        let mut out = Vec::with_capacity(order.len());
        for (position, id) in order.iter().enumerate() {
            let Some(spec) = by_id.get(id.as_str()) else {
                continue;
            };
            let parsed = parse_placeholders(&spec.text);
            let mut ctx = base.clone();
            ctx.set_context("placeholder_id", json!(spec.id), ContextScope::Request);
            ctx.set_context("placeholder_text", json!(spec.text), ContextScope::Request);
            ctx.set_context("depends_on", json!(spec.depends_on), ContextScope::Request);
            if let Some(first) = parsed.first() {
                ctx.set_context("placeholder_type", json!(first.placeholder_type), ContextScope::Request);
            }
            if !ctx.has_value("time_range") {
                if let Some(range) = infer_time_range(&spec.text) {
                    ctx.set_context("time_range", json!(range), ContextScope::Request);
                }
            }
            out.push(PlaceholderContext {
                placeholder_id: spec.id.clone(),
                order: position,
                dependencies: spec.depends_on.clone(),
                parsed,
                context: ctx,
            });
        }
        Ok(out)
    }

    /// 记录执行反馈：指标总是更新；优化与学习按模式启用
    pub fn record_execution_feedback(
        &self,
        task_description: &str,
        context: &ExecutionContext,
        summary: &ExecutionSummary,
        user_feedback: Option<UserFeedback>,
    ) -> FeedbackOutcome {
        let metrics = {
            let mut m = self.metrics.lock();
            m.record(summary.success, summary.confidence, summary.execution_time);
            m.snapshot()
        };
        let target_type = Self::target_type(task_description, &context.to_value_map());

        let kind = self.mode.uses_progressive().then(|| {
            self.progressive
                .collect_feedback(&target_type, context, summary, user_feedback)
                .kind
        });

        let (mut pattern_id, mut avoidance_rule_id) = (None, None);
        if self.mode.uses_learning() {
            if summary.success {
                pattern_id = self
                    .learning
                    .learn_from_success(task_description, context, summary.confidence);
            } else {
                let error = summary.error.as_deref().unwrap_or("unknown failure");
                avoidance_rule_id = Some(self.learning.learn_from_failure(task_description, context, error));
            }
        }

        FeedbackOutcome {
            kind,
            pattern_id,
            avoidance_rule_id,
            metrics,
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics.lock().snapshot()
    }
}

/// Kahn 拓扑排序；同层按输入顺序。id 必须唯一
fn topological_order(placeholders: &[PlaceholderSpec]) -> Result<Vec<String>, IaopError> {
    let mut ids: Vec<&str> = Vec::with_capacity(placeholders.len());
    for p in placeholders {
        if ids.contains(&p.id.as_str()) {
            return Err(IaopError::DuplicatePlaceholder(p.id.clone()));
        }
        ids.push(p.id.as_str());
    }
    for p in placeholders {
        if let Some(missing) = p.depends_on.iter().find(|d| !ids.contains(&d.as_str())) {
            return Err(IaopError::UnknownDependency {
                placeholder: p.id.clone(),
                missing: missing.clone(),
            });
        }
    }

    let mut indegree: HashMap<&str, usize> = placeholders
        .iter()
        .map(|p| (p.id.as_str(), p.depends_on.len()))
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(placeholders.len());
    loop {
        let ready: Vec<&str> = ids
            .iter()
            .copied()
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            indegree.remove(id);
            order.push(id.to_string());
            for p in placeholders.iter().filter(|p| p.depends_on.iter().any(|d| d == id)) {
                if let Some(n) = indegree.get_mut(p.id.as_str()) {
                    *n = n.saturating_sub(1);
                }
            }
        }
    }

    if !indegree.is_empty() {
        let mut stuck: Vec<&str> = indegree.keys().copied().collect();
        stuck.sort_unstable();
        return Err(IaopError::DependencyCycle(stuck.join(", ")));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::optimization::ProtectedKeysCheck;

    fn system(mode: IntegrationMode) -> UnifiedContextSystem {
        let section = ContextSection {
            integration_mode: mode,
            ..Default::default()
        };
        UnifiedContextSystem::new(
            &section,
            OptimizationSection::default(),
            LearningSection::default(),
            Arc::new(ProtectedKeysCheck::default()),
        )
    }

    fn spec(id: &str, text: &str, deps: &[&str]) -> PlaceholderSpec {
        PlaceholderSpec {
            id: id.into(),
            text: text.into(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_mode_ordering() {
        assert!(IntegrationMode::Basic < IntegrationMode::Learning);
        assert!(!IntegrationMode::Basic.uses_intelligent());
        assert!(IntegrationMode::Enhanced.uses_intelligent());
        assert!(!IntegrationMode::Enhanced.uses_progressive());
        assert!(IntegrationMode::Learning.uses_progressive());
    }

    #[test]
    fn test_basic_mode_only_copies_initial_values() {
        let sys = system(IntegrationMode::Basic);
        let request = ContextRequest {
            task_id: "t".into(),
            task_description: "统计上月销售额".into(),
            initial: BTreeMap::from([("placeholder_text".to_string(), json!("上月销售额"))]),
            ..Default::default()
        };
        let created = sys.create_execution_context(&request);
        assert_eq!(created.context.len(), 1);
        assert!(created.enhancements.is_empty());
        assert!(created.optimization.is_none());
        assert_eq!(created.target_type, "placeholder_processing");
    }

    #[test]
    fn test_learning_mode_enhances_context() {
        let sys = system(IntegrationMode::Learning);
        let request = ContextRequest {
            task_id: "t".into(),
            task_description: "统计上月销售额".into(),
            required_keys: vec!["time_range".into()],
            ..Default::default()
        };
        let created = sys.create_execution_context(&request);
        assert_eq!(created.context.get("time_range"), Some(&json!("last_month")));
        assert!(created.optimization.is_some());
        assert!(!created.enhancements.is_empty());
    }

    #[test]
    fn test_placeholders_in_dependency_order() {
        let sys = system(IntegrationMode::Basic);
        let base = ExecutionContext::new("s", "u", "t");
        let specs = vec![
            spec("growth", "{{ratio: 环比增长}}", &["current", "previous"]),
            spec("current", "{{metric: 本月销售额}}", &[]),
            spec("previous", "{{metric: 上月销售额}}", &[]),
        ];
        let out = sys.manage_multi_placeholder_context(&base, &specs).unwrap();
        let ids: Vec<&str> = out.iter().map(|p| p.placeholder_id.as_str()).collect();
        assert_eq!(ids, vec!["current", "previous", "growth"]);
        assert_eq!(out[2].context.get("depends_on"), Some(&json!(["current", "previous"])));
        assert_eq!(out[1].context.get("time_range"), Some(&json!("last_month")));
        assert_eq!(out[0].context.get("placeholder_type"), Some(&json!("metric")));
    }

    #[test]
    fn test_placeholder_cycle_and_unknown_dependency() {
        let sys = system(IntegrationMode::Basic);
        let base = ExecutionContext::new("s", "u", "t");
        let cycle = vec![spec("a", "x", &["b"]), spec("b", "y", &["a"]), spec("c", "z", &[])];
        let err = sys.manage_multi_placeholder_context(&base, &cycle).unwrap_err();
        assert_eq!(err.kind(), "dependency_cycle");
        assert!(err.to_string().contains("a, b"));

        let unknown = vec![spec("a", "x", &["ghost"])];
        let err = sys.manage_multi_placeholder_context(&base, &unknown).unwrap_err();
        assert!(matches!(err, IaopError::UnknownDependency { ref missing, .. } if missing == "ghost"));
    }

    #[test]
    fn test_duplicate_placeholder_ids_rejected() {
        let sys = system(IntegrationMode::Basic);
        let base = ExecutionContext::new("s", "u", "t");
        let dup = vec![spec("a", "上月销售额", &[]), spec("b", "y", &["a"]), spec("a", "本月销售额", &[])];
        let err = sys.manage_multi_placeholder_context(&base, &dup).unwrap_err();
        assert_eq!(err.kind(), "duplicate_placeholder");
        assert!(err.to_string().contains(": a"));
    }

    #[test]
    fn test_feedback_updates_rolling_metrics_and_learning() {
        let sys = system(IntegrationMode::Learning);
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("region", json!("east"), ContextScope::Task);
        let ok = ExecutionSummary {
            success: true,
            confidence: 0.9,
            execution_time: 2.0,
            error: None,
        };
        let outcome = sys.record_execution_feedback("销售统计", &ctx, &ok, None);
        assert_eq!(outcome.kind, Some(FeedbackKind::Success));
        assert!(outcome.pattern_id.is_some());

        let failed = ExecutionSummary {
            success: false,
            confidence: 0.0,
            execution_time: 4.0,
            error: Some("timeout".into()),
        };
        let outcome = sys.record_execution_feedback("销售统计", &ctx, &failed, None);
        assert!(outcome.avoidance_rule_id.is_some());

        let m = sys.metrics();
        assert_eq!(m.total_executions, 2);
        assert_eq!(m.successful_executions, 1);
        assert!((m.success_rate - 0.5).abs() < 1e-9);
        assert!((m.average_latency - 3.0).abs() < 1e-9);
    }
}
