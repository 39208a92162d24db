//! 实现阶段的启发式分类器（确定性、不调用 LLM）
//!
//! 关键词匹配判断主要目标，词重叠度给上下文条目打分，再从文本与上下文形态推断提示词调整参数，
//! 组合成策略记录。全部为纯函数；StrategySelector trait 允许替换为基于模型的分类器。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::overlap_ratio;
use crate::tools::{DataSensitivity, PromptAdaptation, SpecializedAgentType, ToolKind, Urgency, UserRole};

/// 相关度低于此值的上下文条目不进入工具输入
pub const MIN_RELEVANCE: f64 = 0.3;
/// 工具输入最多携带的上下文条目数
pub const MAX_RELEVANT_ENTRIES: usize = 8;

/// 主要目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    PlaceholderProcessing,
    SqlGeneration,
    DataAnalysis,
    ReportGeneration,
    BusinessIntelligence,
    GeneralProcessing,
}

impl GoalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalType::PlaceholderProcessing => "placeholder_processing",
            GoalType::SqlGeneration => "sql_generation",
            GoalType::DataAnalysis => "data_analysis",
            GoalType::ReportGeneration => "report_generation",
            GoalType::BusinessIntelligence => "business_intelligence",
            GoalType::GeneralProcessing => "general_processing",
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            GoalType::PlaceholderProcessing => "specialized_placeholder_analysis",
            GoalType::SqlGeneration => "specialized_sql_generation",
            GoalType::DataAnalysis => "specialized_data_analysis",
            GoalType::ReportGeneration => "adaptive_report_generation",
            GoalType::BusinessIntelligence => "specialized_business_intelligence",
            GoalType::GeneralProcessing => "adaptive_general_processing",
        }
    }

    /// 策略的工具执行顺序（末位工具负责宣告完成）
    pub fn tools(&self) -> Vec<ToolKind> {
        match self {
            GoalType::PlaceholderProcessing => vec![ToolKind::PlaceholderAnalysis],
            GoalType::SqlGeneration => vec![ToolKind::SqlGeneration],
            GoalType::DataAnalysis => vec![ToolKind::DataAnalysis],
            GoalType::ReportGeneration => vec![
                ToolKind::PlaceholderAnalysis,
                ToolKind::DataAnalysis,
                ToolKind::ReportGeneration,
            ],
            GoalType::BusinessIntelligence => vec![
                ToolKind::DataAnalysis,
                ToolKind::BusinessIntelligence,
                ToolKind::ReportGeneration,
            ],
            GoalType::GeneralProcessing => vec![ToolKind::GeneralProcessing],
        }
    }

    pub fn agent_type(&self) -> SpecializedAgentType {
        match self {
            GoalType::PlaceholderProcessing => SpecializedAgentType::PlaceholderExpert,
            GoalType::SqlGeneration => SpecializedAgentType::SqlExpert,
            GoalType::DataAnalysis => SpecializedAgentType::DataAnalyst,
            GoalType::ReportGeneration => SpecializedAgentType::ReportWriter,
            GoalType::BusinessIntelligence => SpecializedAgentType::BusinessAnalyst,
            GoalType::GeneralProcessing => SpecializedAgentType::GeneralAssistant,
        }
    }

    /// 智能体注册表中对应的能力名
    pub fn capability(&self) -> &'static str {
        self.as_str()
    }
}

/// 同分时按此顺序取先者
const GOAL_PRIORITY: [GoalType; 5] = [
    GoalType::PlaceholderProcessing,
    GoalType::SqlGeneration,
    GoalType::DataAnalysis,
    GoalType::ReportGeneration,
    GoalType::BusinessIntelligence,
];

fn goal_keywords(goal: GoalType) -> &'static [&'static str] {
    match goal {
        GoalType::PlaceholderProcessing => &["占位符", "placeholder", "{{"],
        GoalType::SqlGeneration => &[
            "sql", "查询", "query", "select", "统计", "数据库", "database", "汇总", "count", "sum",
        ],
        GoalType::DataAnalysis => &["分析", "analysis", "analyze", "趋势", "trend", "对比", "compare"],
        GoalType::ReportGeneration => &["报告", "report", "文档"],
        GoalType::BusinessIntelligence => &["商业", "business", "洞察", "insight", "kpi", "决策"],
        GoalType::GeneralProcessing => &[],
    }
}

/// 各目标得分：任务文本命中关键词数 + 上下文键加分
pub fn goal_scores(task: &str, context_keys: &[&str]) -> BTreeMap<GoalType, u32> {
    let lower = task.to_lowercase();
    let mut scores = BTreeMap::new();
    for goal in GOAL_PRIORITY {
        let hits = goal_keywords(goal).iter().filter(|k| lower.contains(*k)).count() as u32;
        scores.insert(goal, hits);
    }
    for key in context_keys {
        match *key {
            "data_source_context" => *scores.entry(GoalType::SqlGeneration).or_insert(0) += 2,
            "placeholder_text" => *scores.entry(GoalType::PlaceholderProcessing).or_insert(0) += 1,
            _ => {}
        }
    }
    scores
}

/// 分类主要目标；全部为 0 分时为 general_processing
pub fn classify_goal(task: &str, context_keys: &[&str]) -> GoalType {
    let scores = goal_scores(task, context_keys);
    let mut best = GoalType::GeneralProcessing;
    let mut best_score = 0;
    for goal in GOAL_PRIORITY {
        let s = scores.get(&goal).copied().unwrap_or(0);
        if s > best_score {
            best = goal;
            best_score = s;
        }
    }
    best
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 上下文条目与任务的相关度（降序，同分按键名），过滤低于阈值的条目并截取前若干条
pub fn score_context_relevance(task: &str, context: &BTreeMap<String, Value>) -> Vec<(String, f64)> {
    let mut scored: Vec<(String, f64)> = context
        .iter()
        .map(|(key, value)| {
            let text = format!("{} {}", key, value_text(value));
            let base = overlap_ratio(task, &text);
            let score = match key.as_str() {
                "placeholder_text" => 1.0,
                "data_source_context" => base.max(0.9),
                "template_context" => base.max(0.7),
                _ => base,
            };
            (key.clone(), score)
        })
        .filter(|(_, s)| *s >= MIN_RELEVANCE)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(MAX_RELEVANT_ENTRIES);
    scored
}

fn any_keyword(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// 从任务文本与上下文形态推断用户角色、数据敏感度、紧急度与资源约束
pub fn infer_prompt_adaptation(task: &str, context: &BTreeMap<String, Value>) -> PromptAdaptation {
    let lower = task.to_lowercase();

    let explicit_role = context
        .get("user_role")
        .and_then(|v| serde_json::from_value::<UserRole>(v.clone()).ok());
    let user_role = explicit_role.unwrap_or_else(|| {
        if any_keyword(&lower, &["高管", "总裁", "董事", "executive", "ceo", "管理层"]) {
            UserRole::Executive
        } else if any_keyword(&lower, &["开发", "developer", "接口", "api"]) {
            UserRole::Developer
        } else if any_keyword(&lower, &["分析师", "analyst"]) {
            UserRole::Analyst
        } else {
            UserRole::BusinessUser
        }
    });

    let all_text = format!(
        "{} {}",
        lower,
        context.keys().cloned().collect::<Vec<_>>().join(" ").to_lowercase()
    );
    let data_sensitivity = if any_keyword(
        &all_text,
        &["薪资", "工资", "salary", "身份证", "手机号", "phone", "email", "personal", "个人信息", "password"],
    ) {
        DataSensitivity::High
    } else if any_keyword(
        &all_text,
        &["财务", "finance", "收入", "revenue", "利润", "profit", "销售额", "成本"],
    ) {
        DataSensitivity::Medium
    } else {
        DataSensitivity::Low
    };

    let urgency = if any_keyword(&lower, &["紧急", "urgent", "立即", "asap", "马上", "尽快"]) {
        Urgency::High
    } else if any_keyword(&lower, &["不急", "低优先级", "whenever", "low priority"]) {
        Urgency::Low
    } else {
        Urgency::Normal
    };

    let resource_constrained = context
        .get("resource_constrained")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || context.len() > 20
        || any_keyword(&lower, &["快速", "轻量", "quick", "lightweight"]);

    PromptAdaptation {
        user_role,
        data_sensitivity,
        urgency,
        resource_constrained,
    }
}

/// 实现阶段选出的策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationStrategy {
    pub name: String,
    pub goal: GoalType,
    pub tools: Vec<ToolKind>,
    pub execution_order: Vec<ToolKind>,
    pub confidence: f64,
    pub reasoning: String,
    pub agent_type: SpecializedAgentType,
    pub prompt_adaptation: PromptAdaptation,
    /// (键, 相关度)，按相关度降序
    pub relevant_context: Vec<(String, f64)>,
}

/// 组合目标、相关度与提示词调整，得到策略
pub fn select_strategy(task: &str, context: &BTreeMap<String, Value>) -> ImplementationStrategy {
    let keys: Vec<&str> = context.keys().map(String::as_str).collect();
    let scores = goal_scores(task, &keys);
    let goal = classify_goal(task, &keys);
    let goal_score = scores.get(&goal).copied().unwrap_or(0);
    let relevant_context = score_context_relevance(task, context);
    let prompt_adaptation = infer_prompt_adaptation(task, context);

    let mut confidence = match goal {
        GoalType::GeneralProcessing => 0.5,
        _ => (0.6 + 0.1 * goal_score as f64).min(0.9),
    };
    if !relevant_context.is_empty() {
        confidence += 0.05;
    }
    let confidence = confidence.min(0.95);

    let tools = goal.tools();
    let reasoning = format!(
        "goal {} scored {}; {} relevant context entries; sensitivity {:?}, urgency {:?}",
        goal.as_str(),
        goal_score,
        relevant_context.len(),
        prompt_adaptation.data_sensitivity,
        prompt_adaptation.urgency,
    );

    ImplementationStrategy {
        name: goal.strategy_name().to_string(),
        goal,
        execution_order: tools.clone(),
        tools,
        confidence,
        reasoning,
        agent_type: goal.agent_type(),
        prompt_adaptation,
        relevant_context,
    }
}

/// 策略选择器：可替换为基于模型的分类器
pub trait StrategySelector: Send + Sync {
    fn select(&self, task: &str, context: &BTreeMap<String, Value>) -> ImplementationStrategy;
}

/// 默认的关键词启发式选择器
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordStrategySelector;

impl StrategySelector for KeywordStrategySelector {
    fn select(&self, task: &str, context: &BTreeMap<String, Value>) -> ImplementationStrategy {
        select_strategy(task, context)
    }
}
