//! 渐进式优化引擎：收集反馈、自适应切换策略、逐步应用建议并在高风险失败时整体回滚

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::OptimizationSection;
use crate::context::execution::{is_task_identity_key, ContextScope, ExecutionContext};

/// 判定为成功所需的置信度
const SUCCESS_CONFIDENCE: f64 = 0.8;
/// 策略切换所需的表现差
const SWITCH_MARGIN: f64 = 0.1;
const INITIAL_PERFORMANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Success,
    PartialSuccess,
    UserCorrection,
    Failure,
}

impl FeedbackKind {
    /// 策略表现的更新目标值
    fn reward(&self) -> f64 {
        match self {
            FeedbackKind::Success => 1.0,
            FeedbackKind::PartialSuccess => 0.5,
            FeedbackKind::UserCorrection => 0.25,
            FeedbackKind::Failure => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl OptimizationStrategy {
    pub const ALL: [OptimizationStrategy; 3] = [
        OptimizationStrategy::Conservative,
        OptimizationStrategy::Balanced,
        OptimizationStrategy::Aggressive,
    ];

    /// 单次增量优化最多应用的建议数；None 为不限
    pub fn max_changes(&self) -> Option<usize> {
        match self {
            OptimizationStrategy::Conservative => Some(2),
            OptimizationStrategy::Balanced => Some(5),
            OptimizationStrategy::Aggressive => None,
        }
    }
}

/// 一次执行的结果摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub success: bool,
    pub confidence: f64,
    /// 秒
    pub execution_time: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub correction: bool,
    pub rating: Option<f64>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationFeedback {
    pub id: String,
    pub target_type: String,
    pub kind: FeedbackKind,
    pub confidence: f64,
    pub context_keys: Vec<String>,
    pub strategy: OptimizationStrategy,
    pub timestamp: DateTime<Utc>,
    pub user_feedback: Option<UserFeedback>,
}

/// 用户纠正优先；其次按执行结果与置信度分类
pub fn classify_feedback(summary: &ExecutionSummary, user: Option<&UserFeedback>) -> FeedbackKind {
    if user.map(|u| u.correction).unwrap_or(false) {
        return FeedbackKind::UserCorrection;
    }
    if summary.success && summary.confidence >= SUCCESS_CONFIDENCE {
        FeedbackKind::Success
    } else if summary.success {
        FeedbackKind::PartialSuccess
    } else {
        FeedbackKind::Failure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecommendationAction {
    Set { value: Value },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub key: String,
    pub action: RecommendationAction,
    pub risk: RiskLevel,
    /// 0..1
    pub impact: f64,
    pub confidence: f64,
    pub reason: String,
}

impl Recommendation {
    pub fn new(key: impl Into<String>, action: RecommendationAction, risk: RiskLevel, impact: f64, confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key: key.into(),
            action,
            risk,
            impact,
            confidence,
            reason: String::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    fn apply(&self, ctx: &mut ExecutionContext) {
        match &self.action {
            RecommendationAction::Set { value } => {
                ctx.set_context(self.key.clone(), value.clone(), ContextScope::Task)
            }
            RecommendationAction::Remove => {
                ctx.remove(&self.key);
            }
        }
    }
}

/// 应用一条建议后的安全检查
pub trait SafetyCheck: Send + Sync {
    fn check(&self, before: &ExecutionContext, after: &ExecutionContext, rec: &Recommendation) -> bool;
}

/// 默认检查：受保护的键不能被修改或删除
#[derive(Debug, Clone, Default)]
pub struct ProtectedKeysCheck {
    keys: Vec<String>,
}

impl ProtectedKeysCheck {
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl SafetyCheck for ProtectedKeysCheck {
    fn check(&self, before: &ExecutionContext, after: &ExecutionContext, _rec: &Recommendation) -> bool {
        self.keys.iter().all(|k| before.get(k) == after.get(k))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncrementalResult {
    pub success: bool,
    pub context: ExecutionContext,
    pub applied: Vec<String>,
    /// (建议 id, 原因)
    pub skipped: Vec<(String, String)>,
    pub rollback_executed: bool,
    pub strategy: OptimizationStrategy,
}

#[derive(Debug, Clone, Default)]
struct KeyStats {
    count: u32,
    last_value: Value,
}

#[derive(Debug, Default)]
struct PatternBook {
    feedback_count: u32,
    keys: HashMap<String, KeyStats>,
}

struct EngineState {
    feedback: VecDeque<OptimizationFeedback>,
    success_patterns: HashMap<String, PatternBook>,
    failure_patterns: HashMap<String, PatternBook>,
    current: OptimizationStrategy,
    performance: BTreeMap<OptimizationStrategy, f64>,
    since_adaptation: usize,
}

pub struct ProgressiveOptimizationEngine {
    config: OptimizationSection,
    safety: Arc<dyn SafetyCheck>,
    state: Mutex<EngineState>,
}

impl ProgressiveOptimizationEngine {
    pub fn new(config: OptimizationSection, safety: Arc<dyn SafetyCheck>) -> Self {
        let performance = OptimizationStrategy::ALL
            .iter()
            .map(|s| (*s, INITIAL_PERFORMANCE))
            .collect();
        Self {
            config,
            safety,
            state: Mutex::new(EngineState {
                feedback: VecDeque::new(),
                success_patterns: HashMap::new(),
                failure_patterns: HashMap::new(),
                current: OptimizationStrategy::Balanced,
                performance,
                since_adaptation: 0,
            }),
        }
    }

    pub fn current_strategy(&self) -> OptimizationStrategy {
        self.state.lock().current
    }

    pub fn strategy_performance(&self, strategy: OptimizationStrategy) -> f64 {
        self.state
            .lock()
            .performance
            .get(&strategy)
            .copied()
            .unwrap_or(INITIAL_PERFORMANCE)
    }

    pub fn feedback_len(&self) -> usize {
        self.state.lock().feedback.len()
    }

    /// 记录一次反馈并视情况调整策略
    pub fn collect_feedback(
        &self,
        target_type: &str,
        context: &ExecutionContext,
        summary: &ExecutionSummary,
        user_feedback: Option<UserFeedback>,
    ) -> OptimizationFeedback {
        let kind = classify_feedback(summary, user_feedback.as_ref());
        let mut state = self.state.lock();
        let feedback = OptimizationFeedback {
            id: Uuid::new_v4().to_string(),
            target_type: target_type.to_string(),
            kind,
            confidence: summary.confidence,
            context_keys: context.keys(),
            strategy: state.current,
            timestamp: Utc::now(),
            user_feedback,
        };

        let book = match kind {
            FeedbackKind::Success | FeedbackKind::PartialSuccess => &mut state.success_patterns,
            FeedbackKind::UserCorrection | FeedbackKind::Failure => &mut state.failure_patterns,
        };
        let book = book.entry(target_type.to_string()).or_default();
        book.feedback_count += 1;
        for (key, value) in context.to_value_map() {
            if is_task_identity_key(&key) {
                continue;
            }
            let stats = book.keys.entry(key).or_default();
            stats.count += 1;
            stats.last_value = value;
        }

        state.feedback.push_back(feedback.clone());
        while state.feedback.len() > self.config.max_feedback {
            state.feedback.pop_front();
        }

        let current = state.current;
        let lr = self.config.learning_rate;
        if let Some(perf) = state.performance.get_mut(&current) {
            *perf += lr * (kind.reward() - *perf);
        }

        state.since_adaptation += 1;
        if state.since_adaptation >= self.config.min_feedback_count {
            state.since_adaptation = 0;
            Self::adapt_strategy(&mut state, self.config.min_feedback_count);
        }
        feedback
    }

    /// 当前策略按长期表现与最近窗口成功率的均值评估；候选策略需领先 SWITCH_MARGIN
    fn adapt_strategy(state: &mut EngineState, window: usize) {
        let recent = state.feedback.iter().rev().take(window);
        // 部分成功按 reward 计入
        let (hits, total) = recent.fold((0.0, 0usize), |(h, t), f| (h + f.kind.reward(), t + 1));
        let success_rate = if total == 0 { INITIAL_PERFORMANCE } else { hits / total as f64 };

        let current = state.current;
        let long_run = state.performance.get(&current).copied().unwrap_or(INITIAL_PERFORMANCE);
        let current_perf = (long_run + success_rate) / 2.0;
        let best = state
            .performance
            .iter()
            .filter(|(s, _)| **s != current)
            .fold(None::<(OptimizationStrategy, f64)>, |best, (s, p)| match best {
                Some((_, bp)) if bp >= *p => best,
                _ => Some((*s, *p)),
            });
        if let Some((candidate, perf)) = best {
            if perf - current_perf > SWITCH_MARGIN {
                tracing::info!(
                    from = ?current,
                    to = ?candidate,
                    success_rate,
                    long_run,
                    current_perf,
                    candidate_perf = perf,
                    "optimization strategy switched"
                );
                state.current = candidate;
                return;
            }
        }
        tracing::debug!(strategy = ?current, success_rate, current_perf, "optimization strategy kept");
    }

    /// 由成功与失败模式生成建议：成功中常见而当前缺失的键补上，仅在失败中出现的键移除
    pub fn generate_recommendations(&self, target_type: &str, context: &ExecutionContext) -> Vec<Recommendation> {
        let state = self.state.lock();
        let mut recs = Vec::new();

        if let Some(book) = state.success_patterns.get(target_type) {
            let total = f64::from(book.feedback_count.max(1));
            let mut keys: Vec<(&String, &KeyStats)> = book.keys.iter().collect();
            keys.sort_by(|a, b| a.0.cmp(b.0));
            for (key, stats) in keys {
                let ratio = f64::from(stats.count) / total;
                if ratio >= 0.5 && !context.contains(key) {
                    recs.push(
                        Recommendation::new(
                            key.clone(),
                            RecommendationAction::Set { value: stats.last_value.clone() },
                            RiskLevel::Low,
                            ratio,
                            ratio,
                        )
                        .with_reason(format!("present in {:.0}% of successful runs", ratio * 100.0)),
                    );
                }
            }
        }

        if let Some(book) = state.failure_patterns.get(target_type) {
            let total = f64::from(book.feedback_count.max(1));
            let successes = state.success_patterns.get(target_type);
            let mut keys: Vec<(&String, &KeyStats)> = book.keys.iter().collect();
            keys.sort_by(|a, b| a.0.cmp(b.0));
            for (key, stats) in keys {
                let seen_in_success = successes.map(|b| b.keys.contains_key(key)).unwrap_or(false);
                let ratio = f64::from(stats.count) / total;
                if !seen_in_success && ratio >= 0.5 && context.contains(key) {
                    recs.push(
                        Recommendation::new(key.clone(), RecommendationAction::Remove, RiskLevel::Medium, ratio * 0.8, ratio)
                            .with_reason("only observed in failed runs"),
                    );
                }
            }
        }
        recs
    }

    /// 逐条应用建议：先快照；高风险建议安全检查失败则恢复快照
    pub fn apply_optimization_incrementally(
        &self,
        context: &ExecutionContext,
        mut recommendations: Vec<Recommendation>,
    ) -> IncrementalResult {
        let strategy = self.current_strategy();
        let limit = strategy.max_changes().unwrap_or(usize::MAX);
        let snapshot = context.clone();
        let mut working = context.clone();
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        recommendations.sort_by(|a, b| a.risk.cmp(&b.risk).then(b.impact.total_cmp(&a.impact)));

        for rec in &recommendations {
            if rec.confidence < self.config.safety_confidence_threshold {
                skipped.push((rec.id.clone(), format!("confidence {:.2} below threshold", rec.confidence)));
                continue;
            }
            if applied.len() >= limit {
                skipped.push((rec.id.clone(), format!("{strategy:?} strategy change limit reached")));
                continue;
            }

            let before = working.clone();
            rec.apply(&mut working);
            if self.safety.check(&before, &working, rec) {
                applied.push(rec.id.clone());
                continue;
            }

            if rec.risk == RiskLevel::High {
                tracing::warn!(
                    recommendation = %rec.id,
                    key = %rec.key,
                    applied = applied.len(),
                    "high-risk change failed safety check, rolling back"
                );
                skipped.push((rec.id.clone(), "safety check failed".to_string()));
                return IncrementalResult {
                    success: false,
                    context: snapshot,
                    applied: Vec::new(),
                    skipped,
                    rollback_executed: true,
                    strategy,
                };
            }
            tracing::debug!(recommendation = %rec.id, key = %rec.key, "change reverted after safety check");
            working = before;
            skipped.push((rec.id.clone(), "safety check failed".to_string()));
        }

        IncrementalResult {
            success: true,
            context: working,
            applied,
            skipped,
            rollback_executed: false,
            strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(protected: &[&str]) -> ProgressiveOptimizationEngine {
        ProgressiveOptimizationEngine::new(
            OptimizationSection::default(),
            Arc::new(ProtectedKeysCheck::new(protected.iter().copied())),
        )
    }

    fn summary(success: bool, confidence: f64) -> ExecutionSummary {
        ExecutionSummary {
            success,
            confidence,
            execution_time: 0.1,
            error: None,
        }
    }

    #[test]
    fn test_classify_feedback() {
        assert_eq!(classify_feedback(&summary(true, 0.9), None), FeedbackKind::Success);
        assert_eq!(classify_feedback(&summary(true, 0.5), None), FeedbackKind::PartialSuccess);
        assert_eq!(classify_feedback(&summary(false, 0.0), None), FeedbackKind::Failure);
        let correction = UserFeedback {
            correction: true,
            ..Default::default()
        };
        assert_eq!(
            classify_feedback(&summary(true, 0.9), Some(&correction)),
            FeedbackKind::UserCorrection
        );
    }

    #[test]
    fn test_strategy_switches_after_failures() {
        let engine = engine(&[]);
        let ctx = ExecutionContext::new("s", "u", "t");
        for _ in 0..4 {
            engine.collect_feedback("sql", &ctx, &summary(false, 0.0), None);
        }
        assert_eq!(engine.current_strategy(), OptimizationStrategy::Balanced);
        engine.collect_feedback("sql", &ctx, &summary(false, 0.0), None);
        assert_eq!(engine.current_strategy(), OptimizationStrategy::Conservative);
    }

    #[test]
    fn test_strategy_kept_on_success() {
        let engine = engine(&[]);
        let ctx = ExecutionContext::new("s", "u", "t");
        for _ in 0..10 {
            engine.collect_feedback("sql", &ctx, &summary(true, 0.95), None);
        }
        assert_eq!(engine.current_strategy(), OptimizationStrategy::Balanced);
        assert!(engine.strategy_performance(OptimizationStrategy::Balanced) > 0.5);
        assert_eq!(engine.feedback_len(), 10);
    }

    #[test]
    fn test_recent_failures_switch_despite_slow_average() {
        // 学习率很低时长期表现几乎不动，最近窗口的失败率仍会促成切换
        let engine = ProgressiveOptimizationEngine::new(
            OptimizationSection {
                learning_rate: 0.02,
                ..Default::default()
            },
            Arc::new(ProtectedKeysCheck::default()),
        );
        let ctx = ExecutionContext::new("s", "u", "t");
        for _ in 0..5 {
            engine.collect_feedback("sql", &ctx, &summary(false, 0.0), None);
        }
        assert!(engine.strategy_performance(OptimizationStrategy::Balanced) > 0.4);
        assert_ne!(engine.current_strategy(), OptimizationStrategy::Balanced);
    }

    #[test]
    fn test_partial_successes_keep_strategy() {
        let engine = engine(&[]);
        let ctx = ExecutionContext::new("s", "u", "t");
        for _ in 0..10 {
            engine.collect_feedback("sql", &ctx, &summary(true, 0.5), None);
        }
        assert_eq!(engine.current_strategy(), OptimizationStrategy::Balanced);
    }

    #[test]
    fn test_feedback_fifo_is_bounded() {
        let engine = ProgressiveOptimizationEngine::new(
            OptimizationSection {
                max_feedback: 3,
                ..Default::default()
            },
            Arc::new(ProtectedKeysCheck::default()),
        );
        let ctx = ExecutionContext::new("s", "u", "t");
        for _ in 0..7 {
            engine.collect_feedback("sql", &ctx, &summary(true, 0.9), None);
        }
        assert_eq!(engine.feedback_len(), 3);
    }

    #[test]
    fn test_recommendations_from_patterns() {
        let engine = engine(&[]);
        let mut good = ExecutionContext::new("s", "u", "t");
        good.set_context("region", json!("east"), ContextScope::Task);
        engine.collect_feedback("sql", &good, &summary(true, 0.9), None);

        let mut bad = ExecutionContext::new("s", "u", "t");
        bad.set_context("legacy_flag", json!(true), ContextScope::Task);
        engine.collect_feedback("sql", &bad, &summary(false, 0.0), None);

        let recs = engine.generate_recommendations("sql", &bad);
        assert_eq!(recs.len(), 2);
        assert!(recs
            .iter()
            .any(|r| r.key == "region" && r.action == RecommendationAction::Set { value: json!("east") }));
        assert!(recs.iter().any(|r| r.key == "legacy_flag" && r.action == RecommendationAction::Remove));
    }

    #[test]
    fn test_task_identity_never_recommended() {
        let engine = engine(&[]);
        let mut good = ExecutionContext::new("s", "u", "t");
        good.set_context("placeholder_text", json!("上月销售额"), ContextScope::Task);
        good.set_context("time_range", json!("last_month"), ContextScope::Task);
        good.set_context("data_source_context", json!({"id": "ds-1"}), ContextScope::Task);
        good.set_context("region", json!("east"), ContextScope::Task);
        engine.collect_feedback("sql", &good, &summary(true, 0.95), None);

        let mut failed = ExecutionContext::new("s", "u", "t");
        failed.set_context("placeholder_text", json!("本年订单"), ContextScope::Task);
        engine.collect_feedback("sql", &failed, &summary(false, 0.0), None);

        let fresh = ExecutionContext::new("s", "u", "t2");
        let recs = engine.generate_recommendations("sql", &fresh);
        let keys: Vec<&str> = recs.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["region"]);

        // 调用方给出的标识键不会被建议移除
        assert!(engine.generate_recommendations("sql", &failed).iter().all(|r| r.key != "placeholder_text"));
    }

    #[test]
    fn test_high_risk_failure_rolls_back_to_snapshot() {
        let engine = engine(&["data_source_id"]);
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("data_source_id", json!("ds-1"), ContextScope::Task);

        let recs = vec![
            Recommendation::new("region", RecommendationAction::Set { value: json!("east") }, RiskLevel::Low, 0.5, 0.9),
            Recommendation::new(
                "data_source_id",
                RecommendationAction::Set { value: json!("ds-2") },
                RiskLevel::High,
                0.9,
                0.9,
            ),
        ];
        let result = engine.apply_optimization_incrementally(&ctx, recs);
        assert!(!result.success);
        assert!(result.rollback_executed);
        assert_eq!(result.context, ctx);
    }

    #[test]
    fn test_low_risk_failure_reverts_single_step() {
        let engine = engine(&["locked"]);
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("locked", json!(1), ContextScope::Task);

        let recs = vec![
            Recommendation::new("locked", RecommendationAction::Remove, RiskLevel::Medium, 0.9, 0.9),
            Recommendation::new("region", RecommendationAction::Set { value: json!("east") }, RiskLevel::Low, 0.5, 0.9),
            Recommendation::new("noise", RecommendationAction::Set { value: json!(1) }, RiskLevel::Low, 0.1, 0.3),
        ];
        let result = engine.apply_optimization_incrementally(&ctx, recs);
        assert!(result.success);
        assert!(!result.rollback_executed);
        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.skipped.len(), 2);
        assert_eq!(result.context.get("locked"), Some(&json!(1)));
        assert_eq!(result.context.get("region"), Some(&json!("east")));
        assert!(!result.context.contains("noise"));
    }

    #[test]
    fn test_conservative_strategy_limits_changes() {
        let engine = engine(&[]);
        let ctx = ExecutionContext::new("s", "u", "t");
        for _ in 0..5 {
            engine.collect_feedback("sql", &ctx, &summary(false, 0.0), None);
        }
        assert_eq!(engine.current_strategy(), OptimizationStrategy::Conservative);
        let recs: Vec<Recommendation> = (0..4)
            .map(|i| Recommendation::new(format!("k{i}"), RecommendationAction::Set { value: json!(i) }, RiskLevel::Low, 0.5, 0.9))
            .collect();
        let result = engine.apply_optimization_incrementally(&ctx, recs);
        assert_eq!(result.applied.len(), 2);
        assert_eq!(result.context.len(), 2);
    }
}
