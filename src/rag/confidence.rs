//! Five-dimensional confidence scoring for generated answers.
//!
//! Dimensions: retrieval quality, answer completeness, question-keyword
//! coverage, surface answer quality, and consistency with the retrieved
//! documents. The weighted overall lands in [0, 1] and maps to a coarse
//! low / medium / high level.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::text::{keyword_match_ratio, tokenize};
use crate::agent::state::RetrievedDoc;

const HEDGING_PHRASES: &[&str] = &[
    "可能", "也许", "感觉", "似乎", "不太确定", "might", "maybe", "probably", "seems",
];

const LENGTH_ANCHORS: &[(f32, f32)] = &[(50.0, 0.3), (150.0, 0.6), (300.0, 0.8), (600.0, 1.0)];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub retrieval: f32,
    pub completeness: f32,
    pub keyword_match: f32,
    pub answer_quality: f32,
    pub consistency: f32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            retrieval: 0.45,
            completeness: 0.25,
            keyword_match: 0.15,
            answer_quality: 0.10,
            consistency: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
        }
    }

    fn from_overall(overall: f32) -> Self {
        if overall >= 0.75 {
            ConfidenceLevel::High
        } else if overall >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub retrieval: f32,
    pub completeness: f32,
    pub keyword_match: f32,
    pub answer_quality: f32,
    pub consistency: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub overall: f32,
    pub breakdown: ConfidenceBreakdown,
    pub level: ConfidenceLevel,
}

impl ConfidenceReport {
    pub fn floor() -> Self {
        Self {
            overall: 0.0,
            breakdown: ConfidenceBreakdown::default(),
            level: ConfidenceLevel::Low,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceCalculator {
    weights: ConfidenceWeights,
}

impl Default for ConfidenceCalculator {
    fn default() -> Self {
        Self::new(ConfidenceWeights::default())
    }
}

impl ConfidenceCalculator {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }

    pub fn calculate(
        &self,
        question: &str,
        answer: &str,
        documents: &[RetrievedDoc],
    ) -> ConfidenceReport {
        if documents.is_empty() || answer.trim().is_empty() {
            return ConfidenceReport::floor();
        }

        let breakdown = ConfidenceBreakdown {
            retrieval: retrieval_score(documents),
            completeness: completeness_score(answer),
            keyword_match: keyword_match_score(question, answer),
            answer_quality: answer_quality_score(answer),
            consistency: consistency_score(answer, documents),
        };

        let overall = (breakdown.retrieval * self.weights.retrieval
            + breakdown.completeness * self.weights.completeness
            + breakdown.keyword_match * self.weights.keyword_match
            + breakdown.answer_quality * self.weights.answer_quality
            + breakdown.consistency * self.weights.consistency)
            .clamp(0.0, 1.0);

        let level = ConfidenceLevel::from_overall(overall);
        debug!(overall, ?level, "confidence computed");

        ConfidenceReport {
            overall,
            breakdown,
            level,
        }
    }
}

/// Distances become similarities through `1/(1+d)`; the best document
/// dominates, the rest contribute through the mean.
fn retrieval_score(documents: &[RetrievedDoc]) -> f32 {
    let similarities = documents
        .iter()
        .map(|doc| 1.0 / (1.0 + doc.distance.max(0.0)))
        .collect::<Vec<_>>();

    let best = similarities.iter().cloned().fold(0.0f32, f32::max);
    let mean = similarities.iter().sum::<f32>() / similarities.len() as f32;

    (best * 0.8 + mean * 0.2).clamp(0.0, 1.0)
}

fn interpolate_length(len: f32) -> f32 {
    let (first_len, first_score) = LENGTH_ANCHORS[0];
    if len <= first_len {
        return first_score;
    }
    for window in LENGTH_ANCHORS.windows(2) {
        let (left_len, left_score) = window[0];
        let (right_len, right_score) = window[1];
        if len <= right_len {
            let t = (len - left_len) / (right_len - left_len);
            return left_score + t * (right_score - left_score);
        }
    }
    1.0
}

fn completeness_score(answer: &str) -> f32 {
    let char_count = answer.trim().chars().count() as f32;
    let length_factor = interpolate_length(char_count);

    let sentence_count = answer
        .chars()
        .filter(|c| matches!(c, '。' | '.' | '!' | '?' | '！' | '？'))
        .count();
    let sentence_factor = match sentence_count {
        0 => 0.3,
        1 => 0.6,
        2 => 0.75,
        _ => 1.0,
    };

    (length_factor * 0.6 + sentence_factor * 0.4).clamp(0.0, 1.0)
}

fn keyword_match_score(question: &str, answer: &str) -> f32 {
    let keywords = tokenize(question);
    keyword_match_ratio(&keywords, answer)
}

fn answer_quality_score(answer: &str) -> f32 {
    let mut quality = 0.5f32;

    let ends_sentences = answer
        .chars()
        .any(|c| matches!(c, '。' | '.' | '!' | '?' | '！' | '？'));
    if ends_sentences {
        quality += 0.1;
    }

    let intra_punctuation = answer
        .chars()
        .filter(|c| matches!(c, '，' | ',' | '、' | '；' | ';' | '：' | ':'))
        .count();
    if intra_punctuation >= 2 {
        quality += 0.1;
    }

    let words = tokenize(answer);
    if !words.is_empty() {
        let unique = words.iter().collect::<std::collections::HashSet<_>>().len();
        let unique_ratio = unique as f32 / words.len() as f32;
        if unique_ratio > 0.7 {
            quality += 0.1;
        }
        if unique_ratio > 0.8 {
            quality += 0.1;
        }
    }

    let lowered = answer.to_lowercase();
    let hedges = HEDGING_PHRASES
        .iter()
        .filter(|phrase| lowered.contains(*phrase))
        .count();
    match hedges {
        0 => quality += 0.2,
        1 => quality += 0.1,
        _ => {}
    }

    let char_count = answer.trim().chars().count();
    if char_count > 100 && char_count < 1000 {
        quality += 0.15;
    }
    if char_count > 200 && char_count < 800 {
        quality += 0.05;
    }

    quality.min(1.0)
}

/// Do the concrete claims in the answer (digit runs, keywords) appear in
/// the retrieved text? An answer without digits or keywords is not
/// punished for their absence.
fn consistency_score(answer: &str, documents: &[RetrievedDoc]) -> f32 {
    let combined = documents
        .iter()
        .map(|doc| doc.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let digit_runs = digit_runs(answer);
    let digit_factor = if digit_runs.is_empty() {
        1.0
    } else {
        digit_runs
            .iter()
            .filter(|run| combined.contains(run.as_str()))
            .count() as f32
            / digit_runs.len() as f32
    };

    let keywords = tokenize(answer);
    let keyword_factor = if keywords.is_empty() {
        1.0
    } else {
        keywords
            .iter()
            .filter(|kw| combined.contains(kw.as_str()))
            .count() as f32
            / keywords.len() as f32
    };

    (digit_factor * 0.2 + keyword_factor * 0.8).clamp(0.0, 1.0)
}

fn digit_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str, distance: f32) -> RetrievedDoc {
        RetrievedDoc {
            id: "d".into(),
            content: content.into(),
            score: 1.0 / (1.0 + distance),
            distance,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_no_documents_floors_the_report() {
        let calc = ConfidenceCalculator::default();
        let report = calc.calculate("q", "some answer", &[]);
        assert_eq!(report.overall, 0.0);
        assert_eq!(report.level, ConfidenceLevel::Low);
    }

    #[test]
    fn test_empty_answer_floors_the_report() {
        let calc = ConfidenceCalculator::default();
        let report = calc.calculate("q", "  ", &[doc("content", 0.1)]);
        assert_eq!(report.overall, 0.0);
        assert_eq!(report.level, ConfidenceLevel::Low);
    }

    #[test]
    fn test_overall_stays_in_unit_range() {
        let calc = ConfidenceCalculator::default();
        let cases = [
            ("什么是人工智能？", "人工智能是计算机科学的分支。", vec![doc("人工智能研究智能行为。", 0.2)]),
            ("revenue?", "maybe it's probably around 5.", vec![doc("unrelated text entirely", 9.5)]),
            ("q", "a", vec![doc("", 0.0)]),
        ];

        for (question, answer, docs) in cases {
            let report = calc.calculate(question, answer, &docs);
            assert!((0.0..=1.0).contains(&report.overall));
            let b = report.breakdown;
            for score in [b.retrieval, b.completeness, b.keyword_match, b.answer_quality, b.consistency] {
                assert!((0.0..=1.0).contains(&score), "sub-score out of range: {}", score);
            }
            // overall is exactly the fixed weighted sum
            let expected = b.retrieval * 0.45
                + b.completeness * 0.25
                + b.keyword_match * 0.15
                + b.answer_quality * 0.10
                + b.consistency * 0.05;
            assert!((report.overall - expected.clamp(0.0, 1.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_financial_answer_scores_high() {
        // a crisp numeric answer grounded in the document
        let calc = ConfidenceCalculator::default();
        let report = calc.calculate(
            "2024年营收多少？",
            "2024年营收1000万元。",
            &[doc("2024年营收达到1000万元，同比增长20%。", 0.05)],
        );

        assert!(report.breakdown.retrieval >= 0.8, "retrieval {}", report.breakdown.retrieval);
        assert!(report.breakdown.keyword_match >= 0.5, "keyword {}", report.breakdown.keyword_match);
        assert!(report.breakdown.consistency >= 0.9, "consistency {}", report.breakdown.consistency);
        assert!(report.overall >= 0.75, "overall {}", report.overall);
        assert_eq!(report.level, ConfidenceLevel::High);
    }

    #[test]
    fn test_hedged_answer_scores_lower_quality() {
        let confident = answer_quality_score("营收达到1000万元。");
        let hedged = answer_quality_score("营收可能达到1000万元，也许更多。");
        assert!(hedged < confident);
    }

    #[test]
    fn test_fabricated_numbers_hurt_consistency() {
        let docs = vec![doc("2024年营收达到1000万元。", 0.1)];
        let grounded = consistency_score("营收1000万元。", &docs);
        let fabricated = consistency_score("营收9999万元。", &docs);
        assert!(fabricated < grounded);
    }

    #[test]
    fn test_level_thresholds() {
        assert_eq!(ConfidenceLevel::from_overall(0.49), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_overall(0.5), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_overall(0.74), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_overall(0.75), ConfidenceLevel::High);
    }
}
