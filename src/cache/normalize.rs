//! Question canonicalisation for the semantic query cache. Two questions
//! that normalise to the same keyword set share one cached answer.

use once_cell::sync::Lazy;
use regex::Regex;

/// Canonical forms for common phrasing variants, applied before keyword
/// extraction so that e.g. `Python是啥？` and `Python是什么？` collide.
const SYNONYMS: &[(&str, &str)] = &[
    ("啥", "什么"),
    ("怎样", "怎么"),
    ("为何", "为什么"),
    ("如何", "怎么"),
];

const STOPWORDS: &[&str] = &[
    "什么", "是", "啥", "呢", "吗", "的", "了", "哦", "呃", "is", "are", "what", "the",
];

static PUNCTUATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[？?！!，,。.；;：:'"“”‘’【】\[\]（）()]+"#).expect("punctuation regex to build")
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex to build"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuestion {
    pub text: String,
    pub keywords: Vec<String>,
    pub semantic_hash: String,
}

pub fn normalize(question: &str) -> NormalizedQuestion {
    let mut text = question.to_lowercase().trim().to_owned();
    for (variant, canonical) in SYNONYMS {
        text = text.replace(variant, canonical);
    }

    let text = PUNCTUATION.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(text.trim(), " ").into_owned();

    let mut keywords = text
        .split_whitespace()
        .filter(|word| word.chars().count() > 1 && !STOPWORDS.contains(word))
        .map(|word| word.to_owned())
        .collect::<Vec<_>>();
    keywords.sort();
    keywords.dedup();

    let semantic_hash = blake3::hash(keywords.join(":").as_bytes()).to_hex().to_string();

    NormalizedQuestion {
        text,
        keywords,
        semantic_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synonym_variants_share_a_hash() {
        let first = normalize("Python是什么？");
        let second = normalize("Python是啥？");
        assert_eq!(first.semantic_hash, second.semantic_hash);
        assert_eq!(first.keywords, second.keywords);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize("  What's Python?  怎样入门？");
        let twice = normalize(&once.text);
        assert_eq!(once.text, twice.text);
        assert_eq!(once.keywords, twice.keywords);
        assert_eq!(once.semantic_hash, twice.semantic_hash);
    }

    #[test]
    fn test_stopwords_and_short_tokens_are_dropped() {
        let normalized = normalize("what is the python runtime");
        assert!(!normalized.keywords.contains(&"what".to_owned()));
        assert!(!normalized.keywords.contains(&"is".to_owned()));
        assert!(normalized.keywords.contains(&"python".to_owned()));
        assert!(normalized.keywords.contains(&"runtime".to_owned()));
    }

    #[test]
    fn test_keywords_are_sorted_and_unique() {
        let normalized = normalize("python python zebra apple");
        assert_eq!(normalized.keywords, vec!["apple", "python", "zebra"]);
    }

    #[test]
    fn test_word_order_does_not_change_the_hash() {
        let first = normalize("zebra apple python");
        let second = normalize("python zebra apple");
        assert_eq!(first.semantic_hash, second.semantic_hash);
    }
}
