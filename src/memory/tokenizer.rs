//! 中英文混合分词与文本重叠度
//!
//! 包含 CJK 字符时用 jieba-rs 搜索引擎模式分词，纯英文按非字母数字切分。
//! TT 循环的上下文相关度评分与上下文管理器的相关度计算都基于 overlap_ratio。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化，词典加载较慢）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

const STOP_WORDS: &[&str] = &[
    "的", "了", "和", "与", "及", "在", "是", "对", "the", "and", "for", "of", "to", "in", "by", "a", "an",
];

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep_token(token: &str) -> bool {
    let first_cjk = token.chars().next().map(is_cjk).unwrap_or(false);
    let meaningful = first_cjk || token.chars().filter(|c| c.is_alphanumeric()).count() > 1;
    meaningful && !STOP_WORDS.contains(&token)
}

/// 分词：中文走 jieba，英文按非字母数字字符切分；统一小写并去停用词
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty() && keep_token(s))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|s| s.to_lowercase())
            .filter(|s| keep_token(s))
            .collect()
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 查询词在文本中出现的比例：|query ∩ text| / |query|，查询为空时为 0
pub fn overlap_ratio(query: &str, text: &str) -> f64 {
    let q = tokenize_to_set(query);
    if q.is_empty() {
        return 0.0;
    }
    let t = tokenize_to_set(text);
    q.intersection(&t).count() as f64 / q.len() as f64
}

/// Jaccard 相似度
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f64 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f64;
    let union = set1.union(set2).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese_business_text() {
        let tokens = tokenize("统计上月各区域销售额");
        assert!(tokens.iter().any(|t| t.contains("销售")));
        assert!(!tokens.iter().any(|t| t == "的"));
    }

    #[test]
    fn test_tokenize_english_splits_on_punctuation() {
        let tokens = tokenize("sales_by_region, last 6 months");
        assert!(tokens.contains(&"sales_by_region".to_string()));
        assert!(tokens.contains(&"months".to_string()));
        assert!(!tokens.contains(&"6".to_string()));
    }

    #[test]
    fn test_overlap_ratio() {
        assert_eq!(overlap_ratio("", "anything"), 0.0);
        let r = overlap_ratio("sales revenue report", "monthly sales report");
        assert!((r - 2.0 / 3.0).abs() < 1e-9);
        assert!(overlap_ratio("上月销售额", "上月销售额统计") > 0.5);
    }

    #[test]
    fn test_jaccard_similarity() {
        let a = tokenize_to_set("region sales");
        let b = tokenize_to_set("sales amount");
        let sim = jaccard_similarity(&a, &b);
        assert!((sim - 1.0 / 3.0).abs() < 1e-9);
    }
}
