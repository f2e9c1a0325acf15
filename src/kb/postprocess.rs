//! Retrieval post-processing: scope filter, distance filter, content
//! dedup, and a multi-signal rerank over the surviving results.

use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::rag::text::{keyword_match_ratio, tokenize};
use crate::vector_store::SearchResult;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RerankBreakdown {
    pub vector: f32,
    pub keyword: f32,
    pub completeness: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedResult {
    pub id: String,
    pub content: String,
    /// Raw distance from the vector store, smaller is better
    pub distance: f32,
    /// Composite rerank score, larger is better
    pub combined_score: f32,
    pub breakdown: RerankBreakdown,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RetrievalPostProcessor {
    similarity_threshold: f32,
    top_k: usize,
}

impl RetrievalPostProcessor {
    pub fn new(similarity_threshold: f32, top_k: usize) -> Self {
        Self {
            similarity_threshold,
            top_k,
        }
    }

    pub fn process(
        &self,
        results: Vec<SearchResult>,
        kb_id: &str,
        query: Option<&str>,
    ) -> Vec<ProcessedResult> {
        if results.is_empty() || self.top_k == 0 {
            return Vec::new();
        }
        let raw_count = results.len();

        // Scope filter first: the store may be logically shared, results
        // from other knowledge bases never leak through.
        let filtered = results
            .into_iter()
            .filter(|r| r.metadata.get("kb_id").and_then(|v| v.as_str()) == Some(kb_id))
            .filter(|r| r.score <= self.similarity_threshold)
            .collect::<Vec<_>>();

        if filtered.is_empty() {
            debug!(kb_id, raw_count, "no results survived filtering");
            return Vec::new();
        }

        let deduped = dedup_by_content(filtered);

        let mut processed = match query {
            Some(query) if !query.trim().is_empty() => rerank(deduped, query),
            _ => {
                // no query text, fall back to raw distance order
                let mut sorted = deduped;
                sorted.sort_by(|a, b| a.score.total_cmp(&b.score));
                sorted
                    .into_iter()
                    .map(|r| {
                        let vector = 1.0 / (1.0 + r.score.max(0.0));
                        ProcessedResult {
                            id: r.id,
                            content: r.content,
                            distance: r.score,
                            combined_score: vector,
                            breakdown: RerankBreakdown {
                                vector,
                                ..Default::default()
                            },
                            metadata: r.metadata,
                        }
                    })
                    .collect()
            }
        };

        processed.truncate(self.top_k);
        debug!(
            kb_id,
            raw = raw_count,
            kept = processed.len(),
            "retrieval post-processing finished"
        );
        processed
    }
}

/// Group by normalised content hash, keep the closest member of each group.
fn dedup_by_content(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut groups: HashMap<blake3::Hash, SearchResult> = HashMap::new();

    for result in results {
        let normalized = result.content.to_lowercase().trim().to_owned();
        let hash = blake3::hash(normalized.as_bytes());
        match groups.get(&hash) {
            Some(existing) if existing.score <= result.score => {}
            _ => {
                groups.insert(hash, result);
            }
        }
    }

    groups.into_values().collect()
}

/// Weighted composite of vector proximity, query keyword coverage and
/// content completeness: 0.5 / 0.3 / 0.2.
fn rerank(results: Vec<SearchResult>, query: &str) -> Vec<ProcessedResult> {
    let keywords = tokenize(query);

    let min_distance = results.iter().map(|r| r.score).fold(f32::INFINITY, f32::min);
    let max_distance = results.iter().map(|r| r.score).fold(f32::NEG_INFINITY, f32::max);
    let range = max_distance - min_distance;

    let mut processed = results
        .into_iter()
        .map(|r| {
            let vector = if range > f32::EPSILON {
                1.0 - (r.score - min_distance) / range
            } else {
                1.0 / (1.0 + r.score.max(0.0))
            };
            let keyword = keyword_match_ratio(&keywords, &r.content);
            let completeness = (r.content.trim().chars().count() as f32 / 200.0).min(1.0);

            let combined = vector * 0.5 + keyword * 0.3 + completeness * 0.2;
            ProcessedResult {
                id: r.id,
                content: r.content,
                distance: r.score,
                combined_score: combined,
                breakdown: RerankBreakdown {
                    vector,
                    keyword,
                    completeness,
                },
                metadata: r.metadata,
            }
        })
        .collect::<Vec<_>>();

    processed.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(id: &str, content: &str, distance: f32, kb_id: &str) -> SearchResult {
        SearchResult {
            id: id.into(),
            content: content.into(),
            score: distance,
            metadata: json!({ "kb_id": kb_id, "doc_id": "doc1" }),
        }
    }

    #[test]
    fn test_results_from_other_kbs_are_dropped() {
        let processor = RetrievalPostProcessor::new(10.0, 5);
        let results = vec![
            result("a", "matching content here", 0.5, "kb1"),
            result("b", "foreign content here!", 0.1, "kb2"),
        ];

        let processed = processor.process(results, "kb1", Some("content"));
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].id, "a");
    }

    #[test]
    fn test_distant_results_are_dropped() {
        let processor = RetrievalPostProcessor::new(2.0, 5);
        let results = vec![
            result("near", "close match text here", 1.0, "kb1"),
            result("far", "distant match text far", 5.0, "kb1"),
        ];

        let processed = processor.process(results, "kb1", None);
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].id, "near");
    }

    #[test]
    fn test_duplicate_content_keeps_the_closest() {
        let processor = RetrievalPostProcessor::new(10.0, 5);
        let results = vec![
            result("copy1", "Same Text Here", 2.0, "kb1"),
            result("copy2", "same text here", 0.4, "kb1"),
            result("other", "different text entirely", 1.0, "kb1"),
        ];

        let processed = processor.process(results, "kb1", None);
        assert_eq!(processed.len(), 2);
        assert!(processed.iter().any(|r| r.id == "copy2"));
        assert!(processed.iter().all(|r| r.id != "copy1"));
    }

    #[test]
    fn test_rerank_prefers_keyword_and_completeness() {
        let processor = RetrievalPostProcessor::new(10.0, 5);
        let long_relevant = "python ".repeat(10) + &"is a language with a large ecosystem ".repeat(5);
        let results = vec![
            result("short_far", "short note", 1.2, "kb1"),
            result("relevant", &long_relevant, 1.0, "kb1"),
        ];

        let processed = processor.process(results, "kb1", Some("python language"));
        assert_eq!(processed[0].id, "relevant");
        assert!(processed[0].combined_score > processed[1].combined_score);
        assert!(processed[0].breakdown.keyword > processed[1].breakdown.keyword);
    }

    #[test]
    fn test_without_query_results_sort_by_distance() {
        let processor = RetrievalPostProcessor::new(10.0, 5);
        let results = vec![
            result("far", "alpha beta gamma one", 3.0, "kb1"),
            result("near", "delta epsilon zeta two", 0.5, "kb1"),
            result("mid", "eta theta iota three", 1.5, "kb1"),
        ];

        let processed = processor.process(results, "kb1", None);
        let ids = processed.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["near", "mid", "far"]);
    }

    #[test]
    fn test_truncates_to_top_k() {
        let processor = RetrievalPostProcessor::new(10.0, 2);
        let results = (0..6)
            .map(|i| result(&format!("r{}", i), &format!("unique content number {}", i), i as f32 * 0.3, "kb1"))
            .collect();

        let processed = processor.process(results, "kb1", Some("content"));
        assert_eq!(processed.len(), 2);
    }

    #[test]
    fn test_top_k_zero_yields_nothing() {
        let processor = RetrievalPostProcessor::new(10.0, 0);
        let results = vec![result("a", "text body", 0.1, "kb1")];
        assert!(processor.process(results, "kb1", None).is_empty());
    }
}
