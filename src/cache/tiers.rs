//! The three cache tiers and the manager that owns them.
//!
//! The query-result tier does semantic matching through an inverted index:
//! `semantic_key -> exact_key`. Lookup is a pair of map probes, O(1) in the
//! cache capacity, and the index is cleaned on every path that removes an
//! exact entry (delete, clear, expiry, eviction).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::base::{content_key, CacheCore, CacheStats, CacheTier, TierCache};
use super::normalize;
use crate::agent::state::QueryResponse;

/// Embedding cache (L1). Key is the content hash of the input text.
pub struct EmbeddingCache {
    cache: TierCache<Vec<f32>>,
}

impl EmbeddingCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache: TierCache::new(CacheTier::Embedding, max_size, ttl),
        }
    }

    pub fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        self.cache.get(&content_key(text))
    }

    pub fn set_embedding(&self, text: &str, embedding: Vec<f32>) {
        self.cache.set(content_key(text), embedding);
    }

    /// Batch lookup. Returns the per-input results (`None` for misses), the
    /// texts that missed, and their positions in the input, so the caller
    /// can fill only the holes and write back in bulk.
    pub fn get_batch_embeddings(
        &self,
        texts: &[String],
    ) -> (Vec<Option<Vec<f32>>>, Vec<String>, Vec<usize>) {
        let mut results = Vec::with_capacity(texts.len());
        let mut uncached_texts = Vec::new();
        let mut uncached_indices = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.get_embedding(text) {
                Some(embedding) => results.push(Some(embedding)),
                None => {
                    results.push(None);
                    uncached_texts.push(text.clone());
                    uncached_indices.push(i);
                }
            }
        }

        (results, uncached_texts, uncached_indices)
    }

    pub fn set_batch_embeddings(&self, texts: &[String], embeddings: &[Vec<f32>]) {
        for (text, embedding) in texts.iter().zip(embeddings.iter()) {
            self.set_embedding(text, embedding.clone());
        }
    }

    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

struct QueryCacheState {
    core: CacheCore<QueryResponse>,
    /// semantic_key -> exact_key
    semantic_index: HashMap<String, String>,
    /// exact_key -> semantic_key, so removals clean the index in O(1)
    reverse_index: HashMap<String, String>,
}

impl QueryCacheState {
    fn unlink(&mut self, exact_key: &str) {
        if let Some(semantic_key) = self.reverse_index.remove(exact_key) {
            // Only drop the forward mapping if it still points at us; a
            // later write for the same semantic key may have retargeted it.
            if self.semantic_index.get(&semantic_key).map(String::as_str) == Some(exact_key) {
                self.semantic_index.remove(&semantic_key);
            }
        }
    }
}

/// Query-result cache (L2) with semantic matching.
pub struct QueryResultCache {
    state: Mutex<QueryCacheState>,
}

impl QueryResultCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(QueryCacheState {
                core: CacheCore::new(CacheTier::QueryResult, max_size, ttl),
                semantic_index: HashMap::new(),
                reverse_index: HashMap::new(),
            }),
        }
    }

    pub fn exact_key(kb_id: &str, question: &str) -> String {
        content_key(&format!("{}:{}", kb_id, question))
    }

    pub fn semantic_key(kb_id: &str, question: &str) -> String {
        let normalized = normalize::normalize(question);
        content_key(&format!("{}|{}", kb_id, normalized.semantic_hash))
    }

    pub fn get_result(&self, kb_id: &str, question: &str) -> Option<QueryResponse> {
        let mut state = self.state.lock();

        let exact_key = Self::exact_key(kb_id, question);
        let (hit, expired) = state.core.get(&exact_key);
        if let Some(expired_key) = expired {
            state.unlink(&expired_key);
        }
        if hit.is_some() {
            debug!(kb_id, "query cache exact hit");
            return hit;
        }

        let semantic_key = Self::semantic_key(kb_id, question);
        let stored_key = state.semantic_index.get(&semantic_key).cloned()?;

        let (hit, expired) = state.core.get(&stored_key);
        if let Some(expired_key) = expired {
            state.unlink(&expired_key);
        }
        match hit {
            Some(value) => {
                debug!(kb_id, "query cache semantic hit");
                Some(value)
            }
            None => {
                // The mapped entry is gone, the index entry dangles
                state.unlink(&stored_key);
                state.semantic_index.remove(&semantic_key);
                None
            }
        }
    }

    pub fn set_result(&self, kb_id: &str, question: &str, result: QueryResponse) {
        let mut state = self.state.lock();

        let exact_key = Self::exact_key(kb_id, question);
        let semantic_key = Self::semantic_key(kb_id, question);

        let removed = state.core.set(exact_key.clone(), result, None);
        for removed_key in removed {
            state.unlink(&removed_key);
        }

        state
            .semantic_index
            .insert(semantic_key.clone(), exact_key.clone());
        state.reverse_index.insert(exact_key, semantic_key);
    }

    pub fn delete(&self, kb_id: &str, question: &str) -> bool {
        let mut state = self.state.lock();
        let exact_key = Self::exact_key(kb_id, question);
        let deleted = state.core.delete(&exact_key);
        if deleted {
            state.unlink(&exact_key);
        }
        deleted
    }

    /// Drop every cached answer for a knowledge base, e.g. after a document
    /// delete invalidates prior retrievals.
    pub fn clear_kb(&self, kb_id: &str) -> usize {
        let mut state = self.state.lock();
        let removed = state.core.retain(|_, value| value.kb_id != kb_id);
        let count = removed.len();
        for removed_key in removed {
            state.unlink(&removed_key);
        }
        count
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let size = state.core.clear();
        state.semantic_index.clear();
        state.reverse_index.clear();
        size
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().core.stats()
    }
}

/// Classification record kept in the 7-day tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionClassification {
    pub question_type: String,
    pub classified_at: String,
}

/// Classifier cache (L3). Question classifications change rarely.
pub struct ClassifierCache {
    cache: TierCache<QuestionClassification>,
}

impl ClassifierCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            cache: TierCache::new(CacheTier::RetrievalClassifier, max_size, ttl),
        }
    }

    pub fn get_classification(&self, question: &str) -> Option<QuestionClassification> {
        self.cache.get(&content_key(question))
    }

    pub fn set_classification(&self, question: &str, classification: QuestionClassification) {
        self.cache.set(content_key(question), classification);
    }

    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

pub struct CacheManagerConfig {
    pub embedding_cache_size: usize,
    pub embedding_cache_ttl: Duration,
    pub query_cache_size: usize,
    pub query_cache_ttl: Duration,
    pub classifier_cache_size: usize,
    pub classifier_cache_ttl: Duration,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            embedding_cache_size: 10_000,
            embedding_cache_ttl: Duration::from_secs(86_400),
            query_cache_size: 5_000,
            query_cache_ttl: Duration::from_secs(3_600),
            classifier_cache_size: 2_000,
            classifier_cache_ttl: Duration::from_secs(604_800),
        }
    }
}

/// Process-wide cache manager, constructed once at startup and threaded
/// through request contexts.
pub struct CacheManager {
    pub embedding: EmbeddingCache,
    pub query: QueryResultCache,
    pub classifier: ClassifierCache,
}

impl CacheManager {
    pub fn new(config: CacheManagerConfig) -> Self {
        Self {
            embedding: EmbeddingCache::new(config.embedding_cache_size, config.embedding_cache_ttl),
            query: QueryResultCache::new(config.query_cache_size, config.query_cache_ttl),
            classifier: ClassifierCache::new(
                config.classifier_cache_size,
                config.classifier_cache_ttl,
            ),
        }
    }

    pub fn clear_all(&self) {
        self.embedding.clear();
        self.query.clear();
        self.classifier.clear();
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.embedding.stats(),
            self.query.stats(),
            self.classifier.stats(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(kb_id: &str, question: &str, answer: &str) -> QueryResponse {
        QueryResponse {
            query_id: "q".into(),
            kb_id: kb_id.into(),
            question: question.into(),
            answer: answer.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_then_get_result_roundtrip() {
        let cache = QueryResultCache::new(16, Duration::from_secs(60));
        cache.set_result("kb1", "Python是什么？", response("kb1", "Python是什么？", "a language"));
        let hit = cache.get_result("kb1", "Python是什么？").expect("exact hit");
        assert_eq!(hit.answer, "a language");
    }

    #[test]
    fn test_semantic_hit_across_synonyms() {
        let cache = QueryResultCache::new(16, Duration::from_secs(60));
        cache.set_result("kb1", "Python是什么？", response("kb1", "Python是什么？", "a language"));

        let hit = cache.get_result("kb1", "Python是啥？").expect("semantic hit");
        assert_eq!(hit.answer, "a language");
    }

    #[test]
    fn test_semantic_hit_is_scoped_to_the_kb() {
        let cache = QueryResultCache::new(16, Duration::from_secs(60));
        cache.set_result("kb1", "Python是什么？", response("kb1", "Python是什么？", "a language"));
        assert!(cache.get_result("kb2", "Python是啥？").is_none());
    }

    #[test]
    fn test_delete_cleans_the_semantic_index() {
        let cache = QueryResultCache::new(16, Duration::from_secs(60));
        cache.set_result("kb1", "Python是什么？", response("kb1", "Python是什么？", "a language"));
        assert!(cache.delete("kb1", "Python是什么？"));
        assert!(cache.get_result("kb1", "Python是啥？").is_none());
    }

    #[test]
    fn test_expired_entry_cleans_the_semantic_index() {
        let cache = QueryResultCache::new(16, Duration::ZERO);
        cache.set_result("kb1", "Python是什么？", response("kb1", "Python是什么？", "a language"));
        std::thread::sleep(Duration::from_millis(2));

        assert!(cache.get_result("kb1", "Python是啥？").is_none());
        let state = cache.state.lock();
        assert!(state.semantic_index.is_empty());
        assert!(state.reverse_index.is_empty());
    }

    #[test]
    fn test_clear_kb_only_touches_that_kb() {
        let cache = QueryResultCache::new(16, Duration::from_secs(60));
        cache.set_result("kb1", "q1", response("kb1", "q1", "a1"));
        cache.set_result("kb2", "q2", response("kb2", "q2", "a2"));

        assert_eq!(cache.clear_kb("kb1"), 1);
        assert!(cache.get_result("kb1", "q1").is_none());
        assert!(cache.get_result("kb2", "q2").is_some());
    }

    #[test]
    fn test_batch_embeddings_report_holes_in_order() {
        let cache = EmbeddingCache::new(16, Duration::from_secs(60));
        cache.set_embedding("a", vec![1.0]);
        cache.set_embedding("c", vec![3.0]);

        let texts = vec!["a".to_owned(), "b".to_owned(), "c".to_owned(), "d".to_owned()];
        let (results, uncached_texts, uncached_indices) = cache.get_batch_embeddings(&texts);

        assert_eq!(results.len(), 4);
        assert!(results[0].is_some() && results[2].is_some());
        assert!(results[1].is_none() && results[3].is_none());
        assert_eq!(uncached_texts, vec!["b".to_owned(), "d".to_owned()]);
        assert_eq!(uncached_indices, vec![1, 3]);
    }
}
