//! End-to-end pipeline tests on a fresh stack per test: temp sqlite, temp
//! vector store, deterministic embedder, scripted LLM.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use kbrobot::agent::graph::{AgentSettings, QueryOptions, QueryOrchestrator};
use kbrobot::agent::prompts::MAX_ITERATIONS_FALLBACK;
use kbrobot::cache::tiers::CacheManagerConfig;
use kbrobot::cache::CacheManager;
use kbrobot::chunking::TextChunker;
use kbrobot::db::documents::ChunkRepository;
use kbrobot::db::{init_sqlite_db, SqlDb};
use kbrobot::embedder::{Embedder, EmbedderError};
use kbrobot::kb::ingest::IngestError;
use kbrobot::kb::manager::{IngestOptions, KbSettings};
use kbrobot::kb::KnowledgeBaseManager;
use kbrobot::llm::{
    LLMClient, LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientError,
};
use kbrobot::rag::confidence::ConfidenceCalculator;
use kbrobot::vector_store::store::DistanceMetric;
use kbrobot::vector_store::{HnswConfig, HnswStore};

const DIM: usize = 8;

/// Deterministic embedder: the vector is derived from the content hash, so
/// identical text always lands on the same point.
struct HashEmbedder;

fn hash_vector(text: &str) -> Vec<f32> {
    let hash = blake3::hash(text.trim().as_bytes());
    hash.as_bytes()
        .iter()
        .take(DIM)
        .map(|b| *b as f32 / 255.0)
        .collect()
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(hash_vector(text))
    }

    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Embedder standing in for a provider outage.
struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
        Err(EmbedderError::Unavailable("connection refused".into()))
    }

    async fn batch_embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Err(EmbedderError::Unavailable("connection refused".into()))
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Scripted LLM that records how often it was called.
struct ScriptedLlm {
    answer: String,
    calls: Arc<AtomicUsize>,
}

impl ScriptedLlm {
    fn new(answer: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                answer: answer.to_owned(),
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

#[async_trait]
impl LLMClient for ScriptedLlm {
    async fn stream_completion(
        &self,
        request: LLMClientCompletionRequest,
        sender: UnboundedSender<LLMClientCompletionResponse>,
    ) -> Result<String, LLMClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.answer.is_empty() {
            let _ = sender.send(LLMClientCompletionResponse::new(
                self.answer.clone(),
                Some(self.answer.clone()),
                request.model().to_owned(),
            ));
        }
        Ok(self.answer.clone())
    }
}

struct TestStack {
    _dir: tempfile::TempDir,
    db: SqlDb,
    caches: Arc<CacheManager>,
    store: Arc<HnswStore>,
    manager: Arc<KnowledgeBaseManager>,
}

async fn build_stack(embedder: Arc<dyn Embedder>) -> TestStack {
    let dir = tempfile::tempdir().unwrap();
    let db = init_sqlite_db(dir.path().join("sql_db").join("kbrobot.db"))
        .await
        .unwrap();

    let caches = Arc::new(CacheManager::new(CacheManagerConfig::default()));
    let store = Arc::new(
        HnswStore::open(
            dir.path().join("vector_store"),
            HnswConfig {
                embedding_dim: DIM,
                max_elements: 100_000,
                ef_construction: 200,
                ef_search: 50,
                m: 16,
                distance_metric: DistanceMetric::L2,
                rebuild_threshold: 1000,
            },
        )
        .unwrap(),
    );

    let manager = Arc::new(KnowledgeBaseManager::new(
        db.clone(),
        store.clone(),
        embedder,
        TextChunker::new(1000, 200, 100),
        caches.clone(),
        KbSettings {
            retrieval_top_k: 5,
            retrieval_fetch_multiplier: 5,
            retrieval_similarity_threshold: 10.0,
            temp_dir_base: dir.path().join("kb_temp"),
        },
    ));

    TestStack {
        _dir: dir,
        db,
        caches,
        store,
        manager,
    }
}

fn orchestrator(
    stack: &TestStack,
    llm: Arc<dyn LLMClient>,
    max_iterations: u32,
) -> QueryOrchestrator {
    QueryOrchestrator::new(
        stack.manager.clone(),
        llm,
        stack.caches.clone(),
        ConfidenceCalculator::default(),
        AgentSettings {
            max_iterations,
            ..Default::default()
        },
    )
}

fn seed_document(dir: &Path) -> std::path::PathBuf {
    // 50 distinct ~100 char sentences, 5000 chars total
    let text: String = (0..50)
        .map(|i| format!("第{:02}段{}。", i, "数".repeat(95)))
        .collect();
    let path = dir.join("seed.txt");
    std::fs::write(&path, text).unwrap();
    path
}

#[tokio::test]
async fn test_fresh_kb_ingest_keeps_counters_consistent() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let kb = stack.manager.create_kb("kb-one", None, &[]).await.unwrap();

    let doc_path = seed_document(stack._dir.path());
    let summary = stack
        .manager
        .ingest_document(&kb.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();

    assert!(
        (5..=10).contains(&summary.chunk_count),
        "chunk count {}",
        summary.chunk_count
    );

    // counters on the row match reality
    let stored = stack.manager.get_kb(&kb.id).await.unwrap().unwrap();
    assert_eq!(stored.document_count, 1);
    assert_eq!(stored.total_chunks, summary.chunk_count as i64);

    let stats = stack.manager.kb_stats(&kb.id).await.unwrap();
    assert_eq!(stats.document_count, stored.document_count);
    assert_eq!(stats.total_chunks, stored.total_chunks);

    // chunk rows and live vectors pair up one-to-one
    let chunks = ChunkRepository::new(stack.db.clone())
        .list_by_document(&summary.id)
        .await
        .unwrap();
    assert_eq!(chunks.len(), summary.chunk_count);
    assert_eq!(stack.store.live_count(), summary.chunk_count);
    for chunk in &chunks {
        assert!(stack.store.contains_chunk(&chunk.id));
    }

    // every chunk is retrievable by searching with its own content
    for chunk in &chunks {
        let results = stack
            .manager
            .search(&kb.id, &chunk.content, Some(5))
            .await
            .unwrap();
        assert!(
            results.iter().any(|r| r.id == chunk.id && r.distance <= 10.0),
            "chunk {} not retrievable",
            chunk.chunk_index
        );
    }
}

#[tokio::test]
async fn test_reingesting_the_same_bytes_is_deterministic() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let doc_path = seed_document(stack._dir.path());

    let kb1 = stack.manager.create_kb("first", None, &[]).await.unwrap();
    let kb2 = stack.manager.create_kb("second", None, &[]).await.unwrap();

    let first = stack
        .manager
        .ingest_document(&kb1.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();
    let second = stack
        .manager
        .ingest_document(&kb2.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();

    assert_eq!(first.chunk_count, second.chunk_count);

    let chunk_repo = ChunkRepository::new(stack.db.clone());
    let mut contents1 = chunk_repo
        .list_by_document(&first.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.content)
        .collect::<Vec<_>>();
    let mut contents2 = chunk_repo
        .list_by_document(&second.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.content)
        .collect::<Vec<_>>();
    contents1.sort();
    contents2.sort();
    assert_eq!(contents1, contents2);
}

#[tokio::test]
async fn test_document_delete_removes_both_sides_and_is_idempotent() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let kb = stack.manager.create_kb("kb-del", None, &[]).await.unwrap();
    let doc_path = seed_document(stack._dir.path());

    let summary = stack
        .manager
        .ingest_document(&kb.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();
    assert!(stack.store.live_count() > 0);

    stack.manager.delete_document(&summary.id).await.unwrap();

    let stored = stack.manager.get_kb(&kb.id).await.unwrap().unwrap();
    assert_eq!(stored.document_count, 0);
    assert_eq!(stored.total_chunks, 0);
    assert_eq!(stack.store.live_count(), 0);
    for chunk_id in &summary.chunk_ids {
        assert!(!stack.store.contains_chunk(chunk_id));
    }

    // second delete is a clean not-found, not a crash
    let again = stack.manager.delete_document(&summary.id).await;
    assert!(matches!(again, Err(IngestError::DocumentNotFound(_))));
}

#[tokio::test]
async fn test_kb_cascade_delete() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let kb = stack.manager.create_kb("kb-cascade", None, &[]).await.unwrap();
    let doc_path = seed_document(stack._dir.path());
    stack
        .manager
        .ingest_document(&kb.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();

    assert!(stack.manager.delete_kb(&kb.id).await.unwrap());
    assert!(stack.manager.get_kb(&kb.id).await.unwrap().is_none());
    assert_eq!(stack.store.live_count(), 0);
    assert!(!stack._dir.path().join("kb_temp").join(&kb.id).exists());

    // deleting a missing KB reports not-found instead of erroring
    assert!(!stack.manager.delete_kb(&kb.id).await.unwrap());
}

#[tokio::test]
async fn test_cross_kb_isolation() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let doc_path = seed_document(stack._dir.path());

    let kb1 = stack.manager.create_kb("iso-one", None, &[]).await.unwrap();
    let kb2 = stack.manager.create_kb("iso-two", None, &[]).await.unwrap();
    stack
        .manager
        .ingest_document(&kb1.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();
    stack
        .manager
        .ingest_document(&kb2.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();

    // kb2's copies of the same content are nearer-or-equal in vector
    // space, they must still never leak into kb1 results
    let results = stack.manager.search(&kb1.id, "第01段", Some(10)).await.unwrap();
    assert!(!results.is_empty());
    for result in &results {
        assert_eq!(
            result.metadata.get("kb_id").and_then(|v| v.as_str()),
            Some(kb1.id.as_str())
        );
    }
}

#[tokio::test]
async fn test_semantic_cache_serves_lexical_variants() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let kb = stack.manager.create_kb("kb-cache", None, &[]).await.unwrap();
    let doc_path = seed_document(stack._dir.path());
    stack
        .manager
        .ingest_document(&kb.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();

    let (llm, calls) = ScriptedLlm::new(
        "Python是一种解释型编程语言，广泛用于数据分析、自动化和Web开发，生态系统非常丰富。",
    );
    let orchestrator = orchestrator(&stack, llm, 10);

    let first = orchestrator
        .execute_query(&kb.id, "What is Python?", QueryOptions::default())
        .await;
    assert!(!first.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = orchestrator
        .execute_query(&kb.id, "what's Python", QueryOptions::default())
        .await;
    assert!(second.from_cache, "expected a semantic cache hit");
    assert_eq!(second.answer, first.answer);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no second provider call");
    assert!(second.response_time_ms < 200.0);
}

#[tokio::test]
async fn test_iteration_cap_produces_the_fallback_answer() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    // KB exists but holds nothing, so retrieval keeps coming back empty
    let kb = stack.manager.create_kb("kb-empty", None, &[]).await.unwrap();

    let (llm, calls) = ScriptedLlm::new("never used");
    let orchestrator = orchestrator(&stack, llm, 2);

    let response = orchestrator
        .execute_query(&kb.id, "有什么内容？", QueryOptions::default())
        .await;

    assert_eq!(response.answer, MAX_ITERATIONS_FALLBACK);
    assert!(response.confidence < 0.5);
    assert_eq!(response.confidence_level, "low");
    assert_eq!(response.metadata.iterations, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "generation never ran");
}

#[tokio::test]
async fn test_empty_question_short_circuits() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let (llm, calls) = ScriptedLlm::new("unused");
    let orchestrator = orchestrator(&stack, llm, 10);

    let response = orchestrator.execute_query("kb-x", "   ", QueryOptions::default()).await;

    assert!(response.retrieved_docs.is_empty());
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.confidence_level, "low");
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no provider call");
}

#[tokio::test]
async fn test_embedding_outage_degrades_to_no_context_answer() {
    let stack = build_stack(Arc::new(DownEmbedder)).await;
    let kb = stack.manager.create_kb("kb-down", None, &[]).await.unwrap();

    let (llm, calls) = ScriptedLlm::new("基于通用知识的回答。");
    let orchestrator = orchestrator(&stack, llm, 10);

    let response = orchestrator
        .execute_query(&kb.id, "什么是向量检索？", QueryOptions::default())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "generation still runs");
    assert_eq!(response.answer, "基于通用知识的回答。");
    assert!(response.retrieved_docs.is_empty());
    assert_eq!(response.confidence_level, "low");
    let error = response.metadata.error.expect("degraded marker recorded");
    assert!(error.contains("embedding unavailable"));
}

#[tokio::test]
async fn test_empty_llm_output_is_substituted() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let kb = stack.manager.create_kb("kb-blank", None, &[]).await.unwrap();
    let doc_path = seed_document(stack._dir.path());
    stack
        .manager
        .ingest_document(&kb.id, &doc_path, None, IngestOptions::default())
        .await
        .unwrap();

    let (llm, _calls) = ScriptedLlm::new("");
    let orchestrator = orchestrator(&stack, llm, 10);

    let response = orchestrator
        .execute_query(&kb.id, "第01段的内容？", QueryOptions::default())
        .await;

    assert!(response.answer.contains("抱歉"));
    assert_eq!(response.confidence, 0.0);
    assert_eq!(response.confidence_level, "low");
    assert!(response.metadata.error.is_some());
}

#[tokio::test]
async fn test_attached_file_content_is_fused_into_context() {
    let stack = build_stack(Arc::new(HashEmbedder)).await;
    let kb = stack.manager.create_kb("kb-files", None, &[]).await.unwrap();

    let (llm, _calls) = ScriptedLlm::new("报告显示第三季度增长显著，主要来自海外市场。");
    let orchestrator = orchestrator(&stack, llm, 10);

    let mut file_contents = HashMap::new();
    file_contents.insert(
        "report.txt".to_owned(),
        kbrobot::conversation::FileContent::Text("第三季度营收增长40%，海外市场贡献过半。".to_owned()),
    );

    let response = orchestrator
        .execute_query(
            &kb.id,
            "第三季度表现如何？",
            QueryOptions {
                file_contents,
                ..Default::default()
            },
        )
        .await;

    assert!(!response.retrieved_docs.is_empty());
    let file_doc = &response.retrieved_docs[0];
    assert_eq!(
        file_doc.metadata.get("source").and_then(|v| v.as_str()),
        Some("uploaded_file")
    );
    assert!(response.sources.contains(&"report.txt".to_owned()));
}

/// Cross the default tombstone threshold with one-by-one deletes and
/// watch the store compact itself.
#[tokio::test]
async fn test_thousand_deletes_trigger_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = HnswStore::open(
        dir.path(),
        HnswConfig {
            embedding_dim: DIM,
            max_elements: 10_000,
            ef_construction: 200,
            ef_search: 50,
            m: 16,
            distance_metric: DistanceMetric::L2,
            rebuild_threshold: 1000,
        },
    )
    .unwrap();

    let n = 1100usize;
    let documents = (0..n).map(|i| format!("survivor text {}", i)).collect::<Vec<_>>();
    let embeddings = (0..n)
        .map(|i| (0..DIM).map(|d| i as f32 + d as f32 * 0.001).collect::<Vec<f32>>())
        .collect::<Vec<_>>();
    let metadatas = (0..n)
        .map(|_| serde_json::json!({ "kb_id": "kb1" }))
        .collect::<Vec<_>>();
    let ids = (0..n).map(|i| format!("chunk-{}", i)).collect::<Vec<_>>();
    store
        .add_documents(documents, embeddings.clone(), metadatas, Some(ids))
        .unwrap();

    // rank the survivors before any deletion
    let probe = embeddings[1050].clone();
    let before = store.search(&probe, 5).unwrap();

    // the 1000th delete crosses the threshold and compacts
    for i in 0..1000 {
        store.delete_document(&format!("chunk-{}", i)).unwrap();
    }
    let stats = store.stats();
    assert_eq!(stats.deletion_count, 0, "threshold crossing must compact");
    assert_eq!(stats.deleted_count, 0);
    assert_eq!(stats.count, n - 1000);

    // one more delete starts a fresh tombstone cycle
    store.delete_document("chunk-1000").unwrap();
    let stats = store.stats();
    assert_eq!(stats.deletion_count, 1);
    assert_eq!(stats.count, n - 1001);

    let after = store.search(&probe, 5).unwrap();
    let before_ids = before.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
    let after_ids = after.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
    assert_eq!(
        &before_ids[..3],
        &after_ids[..3],
        "survivor ranking changed across rebuild"
    );
}
