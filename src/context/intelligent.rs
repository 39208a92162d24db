//! 智能上下文优化：质量评分 → 改进 → 再评分，直到达到阈值或迭代耗尽
//!
//! 质量 = 0.4·完整度 + 0.3·相关度 + 0.2·一致性 + 0.1·新鲜度

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::ContextSection;
use crate::context::execution::{ContextScope, ExecutionContext};
use crate::memory::overlap_ratio;
use crate::tools::{infer_time_range, parse_placeholders};

const W_COMPLETENESS: f64 = 0.4;
const W_RELEVANCE: f64 = 0.3;
const W_CONSISTENCY: f64 = 0.2;
const W_FRESHNESS: f64 = 0.1;
/// 相关度低于此值的非必需键被降权
const LOW_RELEVANCE: f64 = 0.2;
const FRESHNESS_HOURS: f64 = 24.0;
const MAX_PATTERNS: usize = 100;

/// 优化目标：目标类型、描述、必需键
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationTarget {
    pub target_type: String,
    pub description: String,
    pub required_keys: Vec<String>,
}

impl OptimizationTarget {
    pub fn new(target_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            description: description.into(),
            required_keys: Vec::new(),
        }
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    fn is_required(&self, key: &str) -> bool {
        self.required_keys.iter().any(|k| k == key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub completeness: f64,
    pub relevance: f64,
    pub consistency: f64,
    pub freshness: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub quality: QualityBreakdown,
    pub improvements: Vec<String>,
}

/// 成功时抽取的可复用模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReusablePattern {
    pub target_type: String,
    pub keys: BTreeSet<String>,
    pub score: f64,
    pub hits: u32,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub success: bool,
    pub context: ExecutionContext,
    pub final_quality: f64,
    pub iterations: Vec<IterationRecord>,
    pub error_analysis: Option<String>,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 互相矛盾的键：time_range 与 period 不一致、start_date 晚于 end_date、必需键为 null
pub fn detect_inconsistencies(ctx: &ExecutionContext, target: &OptimizationTarget) -> Vec<String> {
    let mut issues = Vec::new();
    if let (Some(Value::String(range)), Some(Value::String(period))) = (ctx.get("time_range"), ctx.get("period")) {
        if range != period {
            issues.push(format!("time_range '{range}' conflicts with period '{period}'"));
        }
    }
    if let (Some(Value::String(start)), Some(Value::String(end))) = (ctx.get("start_date"), ctx.get("end_date")) {
        if start > end {
            issues.push(format!("start_date {start} is after end_date {end}"));
        }
    }
    for key in &target.required_keys {
        if matches!(ctx.get(key), Some(Value::Null)) {
            issues.push(format!("required key '{key}' is null"));
        }
    }
    issues
}

fn entry_relevance(key: &str, value: &Value, target: &OptimizationTarget) -> f64 {
    if target.is_required(key) {
        return 1.0;
    }
    overlap_ratio(&target.description, &format!("{key} {}", value_text(value)))
}

/// 对上下文按目标打分
pub fn assess_quality(ctx: &ExecutionContext, target: &OptimizationTarget, now: DateTime<Utc>) -> QualityBreakdown {
    let completeness = if target.required_keys.is_empty() {
        1.0
    } else {
        let missing = target.required_keys.iter().filter(|k| !ctx.has_value(k)).count();
        1.0 - missing as f64 / target.required_keys.len() as f64
    };

    let scored: Vec<f64> = ctx
        .entries()
        .iter()
        .filter(|(_, e)| !e.is_deprioritized())
        .map(|(k, e)| entry_relevance(k, &e.value, target))
        .collect();
    let relevance = if scored.is_empty() {
        0.0
    } else {
        scored.iter().sum::<f64>() / scored.len() as f64
    };

    let conflicts = detect_inconsistencies(ctx, target).len();
    let consistency = (1.0 - 0.25 * conflicts as f64).max(0.0);

    let freshness = if ctx.is_empty() {
        0.0
    } else {
        let total: f64 = ctx
            .entries()
            .values()
            .map(|e| {
                let hours = (now - e.updated_at).num_seconds().max(0) as f64 / 3600.0;
                (-hours / FRESHNESS_HOURS).exp()
            })
            .sum();
        total / ctx.len() as f64
    };

    let score = W_COMPLETENESS * completeness
        + W_RELEVANCE * relevance
        + W_CONSISTENCY * consistency
        + W_FRESHNESS * freshness;
    QualityBreakdown {
        completeness,
        relevance,
        consistency,
        freshness,
        score,
    }
}

/// 从上下文中推断缺失键的值
pub fn infer_missing_value(key: &str, ctx: &ExecutionContext, target: &OptimizationTarget) -> Option<Value> {
    let texts: Vec<String> = std::iter::once(target.description.clone())
        .chain(ctx.entries().values().filter_map(|e| e.value.as_str().map(str::to_string)))
        .collect();
    match key {
        "time_range" => texts.iter().find_map(|t| infer_time_range(t)).map(Value::String),
        "placeholder_type" => texts
            .iter()
            .find_map(|t| parse_placeholders(t).into_iter().next())
            .map(|p| Value::String(p.placeholder_type)),
        "data_source_id" => {
            let ds = ctx.get("data_source_context")?;
            ["id", "source_id", "data_source_id"]
                .iter()
                .find_map(|k| ds.get(*k).filter(|v| !v.is_null()).cloned())
        }
        _ => None,
    }
}

struct PatternStore {
    patterns: Vec<ReusablePattern>,
}

pub struct IntelligentContextManager {
    max_iterations: usize,
    threshold: f64,
    learn_patterns: bool,
    store: Mutex<PatternStore>,
}

impl IntelligentContextManager {
    pub fn new(config: &ContextSection) -> Self {
        Self {
            max_iterations: config.max_optimization_iterations.max(1),
            threshold: config.confidence_threshold,
            learn_patterns: config.enable_pattern_learning,
            store: Mutex::new(PatternStore { patterns: Vec::new() }),
        }
    }

    /// 单次改进：补全、修正、降权、应用提示。返回本次做出的改动说明
    fn improve(
        &self,
        ctx: &mut ExecutionContext,
        target: &OptimizationTarget,
        hints: &Map<String, Value>,
    ) -> Vec<String> {
        let mut changes = Vec::new();

        for key in &target.required_keys {
            if ctx.has_value(key) {
                continue;
            }
            if let Some(value) = infer_missing_value(key, ctx, target) {
                let meta = BTreeMap::from([("provenance".to_string(), json!("inferred"))]);
                ctx.set_with_metadata(key.clone(), value, ContextScope::Task, meta);
                changes.push(format!("inferred {key}"));
            }
        }

        if let (Some(Value::String(range)), Some(Value::String(period))) =
            (ctx.get("time_range").cloned(), ctx.get("period").cloned())
        {
            if range != period {
                ctx.set_context("period", Value::String(range), ContextScope::Task);
                changes.push("aligned period with time_range".to_string());
            }
        }
        if let (Some(start), Some(end)) = (ctx.get("start_date").cloned(), ctx.get("end_date").cloned()) {
            if let (Some(s), Some(e)) = (start.as_str(), end.as_str()) {
                if s > e {
                    ctx.set_context("start_date", end.clone(), ContextScope::Task);
                    ctx.set_context("end_date", start.clone(), ContextScope::Task);
                    changes.push("swapped start_date and end_date".to_string());
                }
            }
        }
        for key in &target.required_keys {
            if matches!(ctx.get(key), Some(Value::Null)) {
                ctx.remove(key);
                changes.push(format!("dropped null {key}"));
            }
        }

        let low: Vec<String> = ctx
            .entries()
            .iter()
            .filter(|(k, e)| !e.is_deprioritized() && entry_relevance(k, &e.value, target) < LOW_RELEVANCE)
            .map(|(k, _)| k.clone())
            .collect();
        for key in low {
            if let Some(entry) = ctx.entry_mut(&key) {
                entry.metadata.insert("deprioritized".to_string(), Value::Bool(true));
                changes.push(format!("deprioritized {key}"));
            }
        }

        for (key, value) in hints {
            if ctx.get(key) != Some(value) {
                let meta = BTreeMap::from([("provenance".to_string(), json!("hint"))]);
                ctx.set_with_metadata(key.clone(), value.clone(), ContextScope::Request, meta);
                changes.push(format!("applied hint {key}"));
            }
        }

        changes
    }

    fn error_analysis(ctx: &ExecutionContext, target: &OptimizationTarget, history: &[IterationRecord]) -> String {
        let best = history
            .iter()
            .map(|r| r.quality.score)
            .fold(0.0_f64, f64::max);
        let last = history.last().map(|r| r.quality).unwrap_or_default();
        let dims = [
            ("completeness", last.completeness),
            ("relevance", last.relevance),
            ("consistency", last.consistency),
            ("freshness", last.freshness),
        ];
        let weakest = dims
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|d| d.0)
            .unwrap_or("completeness");
        let missing: Vec<&str> = target
            .required_keys
            .iter()
            .filter(|k| !ctx.has_value(k))
            .map(String::as_str)
            .collect();
        format!(
            "{} iterations, best score {:.3}; weakest dimension: {}; missing keys: [{}]",
            history.len(),
            best,
            weakest,
            missing.join(", ")
        )
    }

    fn remember_pattern(&self, ctx: &ExecutionContext, target: &OptimizationTarget, score: f64) {
        let keys: BTreeSet<String> = ctx.keys().into_iter().collect();
        let mut store = self.store.lock();
        let now = Utc::now();
        match store
            .patterns
            .iter_mut()
            .find(|p| p.target_type == target.target_type && p.keys == keys)
        {
            Some(p) => {
                p.hits += 1;
                p.score = p.score.max(score);
                p.last_seen = now;
            }
            None => store.patterns.push(ReusablePattern {
                target_type: target.target_type.clone(),
                keys,
                score,
                hits: 1,
                last_seen: now,
            }),
        }
        if store.patterns.len() > MAX_PATTERNS {
            store
                .patterns
                .sort_by(|a, b| b.hits.cmp(&a.hits).then(b.last_seen.cmp(&a.last_seen)));
            store.patterns.truncate(MAX_PATTERNS);
        }
    }

    pub fn patterns(&self, target_type: &str) -> Vec<ReusablePattern> {
        self.store
            .lock()
            .patterns
            .iter()
            .filter(|p| p.target_type == target_type)
            .cloned()
            .collect()
    }

    /// 迭代优化上下文。未达到阈值时返回 success=false 与误差分析，不返回 Err
    pub fn optimize_execution_context(
        &self,
        context: &ExecutionContext,
        target: &OptimizationTarget,
        hints: &Map<String, Value>,
    ) -> OptimizationResult {
        let mut ctx = context.clone();
        let mut history: Vec<IterationRecord> = Vec::new();

        for iteration in 1..=self.max_iterations {
            let quality = assess_quality(&ctx, target, Utc::now());
            tracing::debug!(iteration, score = quality.score, target_type = %target.target_type, "context quality");

            if quality.score >= self.threshold {
                history.push(IterationRecord {
                    iteration,
                    quality,
                    improvements: Vec::new(),
                });
                if self.learn_patterns {
                    self.remember_pattern(&ctx, target, quality.score);
                }
                return OptimizationResult {
                    success: true,
                    context: ctx,
                    final_quality: quality.score,
                    iterations: history,
                    error_analysis: None,
                };
            }

            let improvements = self.improve(&mut ctx, target, hints);
            let stagnated = improvements.is_empty();
            history.push(IterationRecord {
                iteration,
                quality,
                improvements,
            });
            if stagnated {
                tracing::debug!(iteration, "no further improvement possible");
                break;
            }
        }

        // 最后一次改进之后的分数
        let final_quality = assess_quality(&ctx, target, Utc::now()).score;
        if final_quality >= self.threshold {
            if self.learn_patterns {
                self.remember_pattern(&ctx, target, final_quality);
            }
            return OptimizationResult {
                success: true,
                context: ctx,
                final_quality,
                iterations: history,
                error_analysis: None,
            };
        }
        let analysis = Self::error_analysis(&ctx, target, &history);
        tracing::info!(target_type = %target.target_type, final_quality, analysis = %analysis, "context optimization below threshold");
        OptimizationResult {
            success: false,
            context: ctx,
            final_quality,
            iterations: history,
            error_analysis: Some(analysis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IntelligentContextManager {
        IntelligentContextManager::new(&ContextSection::default())
    }

    #[test]
    fn test_quality_weights() {
        let target = OptimizationTarget::new("sql_generation", "销售额").require("time_range");
        let ctx = ExecutionContext::new("s", "u", "t");
        let q = assess_quality(&ctx, &target, Utc::now());
        assert_eq!(q.completeness, 0.0);
        assert_eq!(q.relevance, 0.0);
        assert_eq!(q.consistency, 1.0);
        assert!((q.score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_inconsistencies_detected() {
        let target = OptimizationTarget::new("x", "x");
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("time_range", json!("last_month"), ContextScope::Task);
        ctx.set_context("period", json!("this_year"), ContextScope::Task);
        ctx.set_context("start_date", json!("2024-05-01"), ContextScope::Task);
        ctx.set_context("end_date", json!("2024-04-01"), ContextScope::Task);
        assert_eq!(detect_inconsistencies(&ctx, &target).len(), 2);
    }

    #[test]
    fn test_optimization_infers_missing_time_range() {
        let target = OptimizationTarget::new("sql_generation", "上月销售额").require("time_range");
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("placeholder_text", json!("上月销售额"), ContextScope::Task);

        let result = manager().optimize_execution_context(&ctx, &target, &Map::new());
        assert!(result.success, "{:?}", result.error_analysis);
        assert_eq!(result.context.get("time_range"), Some(&json!("last_month")));
        assert!(result.iterations.len() >= 2);
        assert!(result.final_quality >= 0.8);
        // 原上下文不变
        assert!(!ctx.contains("time_range"));
    }

    #[test]
    fn test_unreachable_threshold_reports_analysis() {
        let target = OptimizationTarget::new("sql_generation", "销售额").require("customer_segment");
        let ctx = ExecutionContext::new("s", "u", "t");
        let result = manager().optimize_execution_context(&ctx, &target, &Map::new());
        assert!(!result.success);
        let analysis = result.error_analysis.unwrap();
        assert!(analysis.contains("customer_segment"));
        assert!(result.iterations.len() <= 5);
    }

    #[test]
    fn test_hints_applied_and_pattern_learned() {
        let target = OptimizationTarget::new("sql_generation", "销售额").require("region");
        let ctx = ExecutionContext::new("s", "u", "t");
        let mut hints = Map::new();
        hints.insert("region".to_string(), json!("华东"));
        let mgr = manager();
        let result = mgr.optimize_execution_context(&ctx, &target, &hints);
        assert!(result.success);
        assert_eq!(result.context.get("region"), Some(&json!("华东")));
        assert_eq!(mgr.patterns("sql_generation").len(), 1);
    }

    #[test]
    fn test_pattern_learned_when_last_iteration_reaches_threshold() {
        let target = OptimizationTarget::new("sql_generation", "销售额").require("region");
        let ctx = ExecutionContext::new("s", "u", "t");
        let mut hints = Map::new();
        hints.insert("region".to_string(), json!("华东"));
        let mgr = IntelligentContextManager::new(&ContextSection {
            max_optimization_iterations: 1,
            ..Default::default()
        });
        let result = mgr.optimize_execution_context(&ctx, &target, &hints);
        assert!(result.success);
        assert_eq!(result.iterations.len(), 1);
        assert!(result.iterations[0].quality.score < result.final_quality);
        let patterns = mgr.patterns("sql_generation");
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].keys.contains("region"));
    }
}
