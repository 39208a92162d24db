//! 学习增强：从成功中沉淀上下文模式，从失败中生成规避规则，按业务领域预填新上下文

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::LearningSection;
use crate::context::execution::{is_task_identity_key, ContextScope, ExecutionContext};
use crate::tools::infer_time_range;

/// 低于此置信度的成功不沉淀为模式
const MIN_PATTERN_CONFIDENCE: f64 = 0.7;

/// 增强值的来源，供调用方审计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    BusinessInference,
    SchemaInference,
    LearnedPattern,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::BusinessInference => "business_inference",
            Provenance::SchemaInference => "schema_inference",
            Provenance::LearnedPattern => "learned_pattern",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPattern {
    pub id: String,
    pub domain: String,
    pub keys: BTreeSet<String>,
    pub values: BTreeMap<String, Value>,
    pub confidence: f64,
    pub success_count: u32,
    pub usage_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// 失败前的上下文形态与改进建议
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvoidanceRule {
    pub id: String,
    pub domain: String,
    pub trigger_keys: BTreeSet<String>,
    pub error: String,
    pub recommendation: String,
    pub occurrences: u32,
    pub usage_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEnhancement {
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    pub provenance: Provenance,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeStats {
    pub patterns: usize,
    pub avoidance_rules: usize,
    pub domains: Vec<String>,
}

/// 业务领域推断
pub fn infer_domain(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let rules: [(&str, &[&str]); 4] = [
        ("sales", &["销售", "sales", "revenue", "营收", "订单", "order"]),
        ("finance", &["财务", "finance", "利润", "profit", "成本", "cost", "预算", "budget"]),
        ("operations", &["运营", "operation", "库存", "inventory", "物流", "logistics"]),
        ("customer", &["客户", "customer", "用户", "满意度", "churn", "留存"]),
    ];
    rules
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(domain, _)| *domain)
        .unwrap_or("general")
}

fn recommendation_for(error: &str) -> String {
    let lower = error.to_lowercase();
    if lower.contains("time") || lower.contains("时间") || lower.contains("date") {
        "provide an explicit time_range".to_string()
    } else if lower.contains("connect") || lower.contains("data source") || lower.contains("数据源") {
        "verify data_source_context before execution".to_string()
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "narrow the task scope or raise timeout_seconds".to_string()
    } else {
        "review the context keys that preceded this failure".to_string()
    }
}

#[derive(Default)]
struct KnowledgeBase {
    patterns: Vec<ContextPattern>,
    rules: Vec<AvoidanceRule>,
}

pub struct LearningEnhancedContextSystem {
    config: LearningSection,
    kb: RwLock<KnowledgeBase>,
}

impl LearningEnhancedContextSystem {
    pub fn new(config: LearningSection) -> Self {
        Self {
            config,
            kb: RwLock::new(KnowledgeBase::default()),
        }
    }

    /// 高置信度成功：强化同领域同键集合的模式，任务标识键不入模式
    pub fn learn_from_success(&self, task: &str, context: &ExecutionContext, confidence: f64) -> Option<String> {
        if confidence < MIN_PATTERN_CONFIDENCE {
            return None;
        }
        let values: BTreeMap<String, Value> = context
            .to_value_map()
            .into_iter()
            .filter(|(key, _)| !is_task_identity_key(key))
            .collect();
        if values.is_empty() {
            return None;
        }
        let domain = infer_domain(task);
        let keys: BTreeSet<String> = values.keys().cloned().collect();
        let now = Utc::now();
        let mut kb = self.kb.write();

        if let Some(p) = kb.patterns.iter_mut().find(|p| p.domain == domain && p.keys == keys) {
            let n = f64::from(p.success_count);
            p.confidence = (p.confidence * n + confidence) / (n + 1.0);
            p.success_count += 1;
            p.values = values;
            p.last_used = now;
            return Some(p.id.clone());
        }
        let id = Uuid::new_v4().to_string();
        tracing::debug!(domain, keys = keys.len(), "new context pattern learned");
        kb.patterns.push(ContextPattern {
            id: id.clone(),
            domain: domain.to_string(),
            keys,
            values,
            confidence,
            success_count: 1,
            usage_count: 0,
            created_at: now,
            last_used: now,
        });
        Some(id)
    }

    /// 失败：生成或累加规避规则
    pub fn learn_from_failure(&self, task: &str, context: &ExecutionContext, error: &str) -> String {
        let domain = infer_domain(task);
        let trigger_keys: BTreeSet<String> = context.keys().into_iter().collect();
        let now = Utc::now();
        let mut kb = self.kb.write();
        if let Some(rule) = kb
            .rules
            .iter_mut()
            .find(|r| r.domain == domain && r.trigger_keys == trigger_keys && r.error == error)
        {
            rule.occurrences += 1;
            rule.last_used = now;
            return rule.id.clone();
        }
        let id = Uuid::new_v4().to_string();
        tracing::debug!(domain, error, "avoidance rule recorded");
        kb.rules.push(AvoidanceRule {
            id: id.clone(),
            domain: domain.to_string(),
            trigger_keys,
            error: error.to_string(),
            recommendation: recommendation_for(error),
            occurrences: 1,
            usage_count: 0,
            created_at: now,
            last_used: now,
        });
        id
    }

    /// 按业务推断、数据源结构与已学模式补全上下文；只填缺失键
    pub fn enhance_context(&self, task: &str, context: &mut ExecutionContext) -> Vec<ContextEnhancement> {
        let domain = infer_domain(task);
        let mut out = Vec::new();
        let mut apply = |ctx: &mut ExecutionContext, e: ContextEnhancement| {
            let meta = BTreeMap::from([
                ("provenance".to_string(), json!(e.provenance.as_str())),
                ("confidence".to_string(), json!(e.confidence)),
                ("source".to_string(), json!(e.source)),
            ]);
            ctx.set_with_metadata(e.key.clone(), e.value.clone(), ContextScope::Task, meta);
            out.push(e);
        };

        if !context.has_value("time_range") {
            if let Some(range) = infer_time_range(task) {
                apply(
                    context,
                    ContextEnhancement {
                        key: "time_range".into(),
                        value: Value::String(range),
                        confidence: 0.8,
                        provenance: Provenance::BusinessInference,
                        source: "task description".into(),
                    },
                );
            }
        }
        if !context.has_value("business_domain") {
            apply(
                context,
                ContextEnhancement {
                    key: "business_domain".into(),
                    value: json!(domain),
                    confidence: if domain == "general" { 0.4 } else { 0.7 },
                    provenance: Provenance::BusinessInference,
                    source: "domain keywords".into(),
                },
            );
        }

        if let Some(ds) = context.get("data_source_context").cloned() {
            if !context.has_value("data_source_id") {
                if let Some(id) = ["id", "source_id"].iter().find_map(|k| ds.get(*k).filter(|v| !v.is_null())) {
                    apply(
                        context,
                        ContextEnhancement {
                            key: "data_source_id".into(),
                            value: id.clone(),
                            confidence: 0.9,
                            provenance: Provenance::SchemaInference,
                            source: "data_source_context".into(),
                        },
                    );
                }
            }
            if !context.has_value("table_name") {
                if let Some([table]) = ds.get("tables").and_then(Value::as_array).map(Vec::as_slice) {
                    apply(
                        context,
                        ContextEnhancement {
                            key: "table_name".into(),
                            value: table.clone(),
                            confidence: 0.75,
                            provenance: Provenance::SchemaInference,
                            source: "data_source_context.tables".into(),
                        },
                    );
                }
            }
        }

        let now = Utc::now();
        let mut kb = self.kb.write();
        let best = kb
            .patterns
            .iter_mut()
            .filter(|p| p.domain == domain && p.confidence >= MIN_PATTERN_CONFIDENCE)
            .max_by(|a, b| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(a.success_count.cmp(&b.success_count))
            });
        if let Some(pattern) = best {
            pattern.usage_count += 1;
            pattern.last_used = now;
            for (key, value) in &pattern.values {
                if !is_task_identity_key(key) && !context.has_value(key) {
                    apply(
                        context,
                        ContextEnhancement {
                            key: key.clone(),
                            value: value.clone(),
                            confidence: pattern.confidence,
                            provenance: Provenance::LearnedPattern,
                            source: pattern.id.clone(),
                        },
                    );
                }
            }
        }
        drop(kb);
        out
    }

    /// 当前上下文命中的规避规则（触发键全部出现）
    pub fn avoidance_warnings(&self, task: &str, context: &ExecutionContext) -> Vec<AvoidanceRule> {
        let domain = infer_domain(task);
        let mut kb = self.kb.write();
        let now = Utc::now();
        kb.rules
            .iter_mut()
            .filter(|r| r.domain == domain && r.trigger_keys.iter().all(|k| context.contains(k)))
            .map(|r| {
                r.usage_count += 1;
                r.last_used = now;
                r.clone()
            })
            .collect()
    }

    /// 同时超出保留窗口且使用次数不足的知识被清理
    pub fn prune_knowledge_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(self.config.retention_days);
        let min_usage = self.config.min_usage_count;
        let mut kb = self.kb.write();
        let before = kb.patterns.len() + kb.rules.len();
        kb.patterns
            .retain(|p| p.last_used >= cutoff || p.usage_count + p.success_count >= min_usage);
        kb.rules
            .retain(|r| r.last_used >= cutoff || r.usage_count + r.occurrences >= min_usage);
        let removed = before - (kb.patterns.len() + kb.rules.len());
        if removed > 0 {
            tracing::info!(removed, "stale knowledge pruned");
        }
        removed
    }

    pub fn prune_knowledge(&self) -> usize {
        self.prune_knowledge_at(Utc::now())
    }

    pub fn patterns_for(&self, domain: &str) -> Vec<ContextPattern> {
        self.kb
            .read()
            .patterns
            .iter()
            .filter(|p| p.domain == domain)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> KnowledgeStats {
        let kb = self.kb.read();
        let domains: BTreeSet<String> = kb
            .patterns
            .iter()
            .map(|p| p.domain.clone())
            .chain(kb.rules.iter().map(|r| r.domain.clone()))
            .collect();
        KnowledgeStats {
            patterns: kb.patterns.len(),
            avoidance_rules: kb.rules.len(),
            domains: domains.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::execution::TASK_IDENTITY_KEYS;

    fn system() -> LearningEnhancedContextSystem {
        LearningEnhancedContextSystem::new(LearningSection::default())
    }

    #[test]
    fn test_infer_domain() {
        assert_eq!(infer_domain("生成上月销售额统计"), "sales");
        assert_eq!(infer_domain("quarterly profit review"), "finance");
        assert_eq!(infer_domain("库存周转"), "operations");
        assert_eq!(infer_domain("客户流失分析"), "customer");
        assert_eq!(infer_domain("hello"), "general");
    }

    #[test]
    fn test_enhancements_carry_provenance() {
        let sys = system();
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context(
            "data_source_context",
            json!({"id": "ds-1", "tables": ["sales"]}),
            ContextScope::Task,
        );
        let enh = sys.enhance_context("统计上月销售额", &mut ctx);
        let by_key: BTreeMap<&str, &ContextEnhancement> = enh.iter().map(|e| (e.key.as_str(), e)).collect();
        assert_eq!(by_key["time_range"].provenance, Provenance::BusinessInference);
        assert_eq!(by_key["data_source_id"].provenance, Provenance::SchemaInference);
        assert_eq!(by_key["table_name"].value, json!("sales"));
        assert_eq!(ctx.get("business_domain"), Some(&json!("sales")));
        let meta = &ctx.entry("data_source_id").unwrap().metadata;
        assert_eq!(meta["provenance"], json!("schema_inference"));
    }

    #[test]
    fn test_learned_pattern_prefills_new_context() {
        let sys = system();
        let mut done = ExecutionContext::new("s", "u", "t");
        done.set_context("region", json!("华东"), ContextScope::Task);
        assert!(sys.learn_from_success("销售统计", &done, 0.9).is_some());
        assert!(sys.learn_from_success("销售统计", &done, 0.3).is_none());

        let mut fresh = ExecutionContext::new("s2", "u", "t2");
        let enh = sys.enhance_context("销售汇总", &mut fresh);
        let learned: Vec<&ContextEnhancement> = enh
            .iter()
            .filter(|e| e.provenance == Provenance::LearnedPattern)
            .collect();
        assert_eq!(learned.len(), 1);
        assert_eq!(fresh.get("region"), Some(&json!("华东")));
        assert_eq!(sys.patterns_for("sales")[0].usage_count, 1);
        // 其他领域不受影响
        let mut other = ExecutionContext::new("s3", "u", "t3");
        sys.enhance_context("库存盘点", &mut other);
        assert!(!other.contains("region"));
    }

    #[test]
    fn test_task_identity_stays_with_its_task() {
        let sys = system();
        let mut first = ExecutionContext::new("s", "u", "t1");
        first.set_context("placeholder_text", json!("上月销售额"), ContextScope::Task);
        first.set_context("data_source_context", json!({"id": "ds-1"}), ContextScope::Task);
        first.set_context("region", json!("华东"), ContextScope::Task);
        sys.enhance_context("生成上月销售额统计", &mut first);
        assert!(first.contains("data_source_id"));
        assert!(sys.learn_from_success("生成上月销售额统计", &first, 0.95).is_some());

        let patterns = sys.patterns_for("sales");
        let pattern = &patterns[0];
        assert!(pattern.keys.contains("region"));
        for key in TASK_IDENTITY_KEYS {
            assert!(!pattern.keys.contains(key), "{key} learned");
        }

        let mut second = ExecutionContext::new("s", "u", "t2");
        let enh = sys.enhance_context("汇总本年销售订单", &mut second);
        assert_eq!(second.get("region"), Some(&json!("华东")));
        assert!(!second.contains("placeholder_text"));
        assert!(!second.contains("data_source_context"));
        assert!(!second.contains("data_source_id"));
        let learned: Vec<&str> = enh
            .iter()
            .filter(|e| e.provenance == Provenance::LearnedPattern)
            .map(|e| e.key.as_str())
            .collect();
        assert!(!learned.is_empty());
        assert!(learned.iter().all(|k| !is_task_identity_key(k)));

        // 只有标识键的上下文不产生模式
        let mut bare = ExecutionContext::new("s", "u", "t3");
        bare.set_context("placeholder_text", json!("x"), ContextScope::Task);
        assert!(sys.learn_from_success("库存盘点", &bare, 0.95).is_none());
    }

    #[test]
    fn test_failures_become_avoidance_rules() {
        let sys = system();
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("placeholder_text", json!("销售额"), ContextScope::Task);
        sys.learn_from_failure("销售统计", &ctx, "data source connection refused");
        sys.learn_from_failure("销售统计", &ctx, "data source connection refused");

        let warnings = sys.avoidance_warnings("销售报表", &ctx);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].occurrences, 2);
        assert!(warnings[0].recommendation.contains("data_source_context"));
    }

    #[test]
    fn test_prune_requires_age_and_low_usage() {
        let sys = system();
        let mut ctx = ExecutionContext::new("s", "u", "t");
        ctx.set_context("k", json!(1), ContextScope::Task);
        sys.learn_from_success("销售", &ctx, 0.9);
        sys.learn_from_failure("财务", &ctx, "boom");
        sys.learn_from_failure("财务", &ctx, "boom");

        assert_eq!(sys.prune_knowledge(), 0);
        let later = Utc::now() + Duration::days(31);
        // 模式只成功过一次，规则出现过两次
        assert_eq!(sys.prune_knowledge_at(later), 1);
        let stats = sys.stats();
        assert_eq!(stats.patterns, 0);
        assert_eq!(stats.avoidance_rules, 1);
    }
}
