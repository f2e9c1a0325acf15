//! Application wiring: every subsystem is constructed once here and
//! threaded through request contexts by handle, no process-wide globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::OnceCell;
use tracing::warn;

use super::config::configuration::Configuration;
use super::logging::tracing::tracing_subscribe;
use crate::agent::graph::{AgentSettings, QueryOrchestrator};
use crate::cache::tiers::CacheManagerConfig;
use crate::cache::CacheManager;
use crate::chunking::TextChunker;
use crate::conversation::files::ConversationFileStore;
use crate::db::conversations::ConversationRepository;
use crate::db::{init_sqlite_db, SqlDb};
use crate::embedder::{Embedder, RemoteEmbedder};
use crate::kb::manager::KbSettings;
use crate::kb::KnowledgeBaseManager;
use crate::llm::{LLMClient, OpenAiCompatibleClient};
use crate::rag::confidence::ConfidenceCalculator;
use crate::vector_store::store::DistanceMetric;
use crate::vector_store::{HnswConfig, HnswStore};

static LOGGER_INSTALLED: OnceCell<bool> = OnceCell::new();

#[derive(Clone)]
pub struct Application {
    pub config: Arc<Configuration>,
    pub sql: SqlDb,
    pub caches: Arc<CacheManager>,
    pub vector_store: Arc<HnswStore>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LLMClient>,
    pub kb_manager: Arc<KnowledgeBaseManager>,
    pub conversations: ConversationRepository,
    pub file_store: Arc<ConversationFileStore>,
    pub orchestrator: Arc<QueryOrchestrator>,
}

impl Application {
    pub async fn initialize(config: Configuration) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let sql = init_sqlite_db(config.sqlite_path())
            .await
            .context("sqlite setup failed")?;

        let caches = Arc::new(CacheManager::new(CacheManagerConfig {
            embedding_cache_size: config.embedding_cache_size,
            embedding_cache_ttl: Duration::from_secs(config.embedding_cache_ttl_secs),
            query_cache_size: config.query_cache_size,
            query_cache_ttl: Duration::from_secs(config.query_cache_ttl_secs),
            classifier_cache_size: config.classifier_cache_size,
            classifier_cache_ttl: Duration::from_secs(config.classifier_cache_ttl_secs),
        }));

        let vector_store = Arc::new(
            HnswStore::open(
                config.vector_store_dir(),
                HnswConfig {
                    embedding_dim: config.embedding_dim,
                    max_elements: config.hnsw_max_elements,
                    ef_construction: config.hnsw_ef_construction,
                    ef_search: config.hnsw_ef_search,
                    m: config.hnsw_m,
                    distance_metric: DistanceMetric::parse(&config.hnsw_distance_metric),
                    rebuild_threshold: config.hnsw_rebuild_threshold,
                },
            )
            .context("vector store setup failed")?,
        );

        let embedder: Arc<dyn Embedder> = Arc::new(RemoteEmbedder::new(
            config.embedding_api_base.clone(),
            config.embedding_api_key.clone(),
            config.embedding_model.clone(),
            config.embedding_dim,
            Some(caches.clone()),
        ));

        let llm: Arc<dyn LLMClient> = Arc::new(OpenAiCompatibleClient::new(
            config.llm_api_base.clone(),
            config.llm_api_key.clone(),
        ));

        let chunker = TextChunker::new(
            config.text_chunk_size,
            config.text_chunk_overlap,
            config.text_min_chunk_size,
        );

        let kb_manager = Arc::new(KnowledgeBaseManager::new(
            sql.clone(),
            vector_store.clone(),
            embedder.clone(),
            chunker,
            caches.clone(),
            KbSettings {
                retrieval_top_k: config.retrieval_top_k,
                retrieval_fetch_multiplier: config.retrieval_fetch_multiplier,
                retrieval_similarity_threshold: config.retrieval_similarity_threshold,
                temp_dir_base: config.data_dir.join("kb_temp"),
            },
        ));

        let file_store = Arc::new(ConversationFileStore::new(
            config.conversation_temp_dir(),
            100 * 1024 * 1024,
            5000,
        ));

        let orchestrator = Arc::new(QueryOrchestrator::new(
            kb_manager.clone(),
            llm.clone(),
            caches.clone(),
            ConfidenceCalculator::new(config.confidence_weights()),
            AgentSettings {
                llm_model: config.llm_model.clone(),
                llm_temperature: config.llm_temperature,
                llm_max_tokens: config.llm_max_tokens,
                top_k: config.retrieval_top_k,
                max_iterations: config.max_iterations,
                query_timeout: Duration::from_secs(config.query_timeout_seconds),
                file_content_weight: config.file_content_weight,
                kb_content_weight: config.kb_content_weight,
            },
        ));

        Ok(Self {
            conversations: ConversationRepository::new(sql.clone()),
            sql,
            caches,
            vector_store,
            embedder,
            llm,
            kb_manager,
            file_store,
            orchestrator,
            config,
        })
    }

    pub fn install_logging(config: &Configuration) {
        if let Some(true) = LOGGER_INSTALLED.get() {
            return;
        }

        if !tracing_subscribe(config) {
            warn!("failed to install tracing subscriber, there is probably one already");
        }

        _ = LOGGER_INSTALLED.set(true);
    }
}
