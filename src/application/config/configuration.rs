use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Configuration {
    #[clap(short, long, default_value_os_t = default_data_dir())]
    #[serde(default = "default_data_dir")]
    /// Directory to store all persistent state (sqlite db, vector index, logs, temp files)
    pub data_dir: PathBuf,

    #[clap(long, default_value_t = default_host())]
    #[serde(default = "default_host")]
    /// Bind the webserver to `<host>`
    pub host: String,

    #[clap(long, default_value_t = default_port())]
    #[serde(default = "default_port")]
    /// Bind the webserver to `<port>`
    pub port: u16,

    #[clap(long, default_value_t = default_llm_api_base())]
    #[serde(default = "default_llm_api_base")]
    /// OpenAI-compatible chat completions endpoint base
    pub llm_api_base: String,

    #[clap(long, default_value_t = String::new())]
    #[serde(default)]
    pub llm_api_key: String,

    #[clap(long, default_value_t = default_llm_model())]
    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    #[clap(long, default_value_t = 0.7)]
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,

    #[clap(long, default_value_t = 2000)]
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: usize,

    #[clap(long, default_value_t = default_embedding_api_base())]
    #[serde(default = "default_embedding_api_base")]
    /// OpenAI-compatible embeddings endpoint base
    pub embedding_api_base: String,

    #[clap(long, default_value_t = String::new())]
    #[serde(default)]
    pub embedding_api_key: String,

    #[clap(long, default_value_t = default_embedding_model())]
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[clap(long, default_value_t = 1536)]
    #[serde(default = "default_embedding_dim")]
    /// Vector width of the index, must match the embedding provider
    pub embedding_dim: usize,

    #[clap(long, default_value_t = 1_000_000)]
    #[serde(default = "default_hnsw_max_elements")]
    pub hnsw_max_elements: usize,

    #[clap(long, default_value_t = 200)]
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,

    #[clap(long, default_value_t = 100)]
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,

    #[clap(long, default_value_t = 16)]
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,

    #[clap(long, default_value_t = default_hnsw_distance_metric())]
    #[serde(default = "default_hnsw_distance_metric")]
    /// One of l2, cosine, ip
    pub hnsw_distance_metric: String,

    #[clap(long, default_value_t = 1000)]
    #[serde(default = "default_rebuild_threshold")]
    /// Tombstones accumulated before the index is compacted
    pub hnsw_rebuild_threshold: u64,

    #[clap(long, default_value_t = 5)]
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    #[clap(long, default_value_t = 5)]
    #[serde(default = "default_retrieval_fetch_multiplier")]
    /// Over-fetch factor for the raw vector search, the post-processor trims back down
    pub retrieval_fetch_multiplier: usize,

    #[clap(long, default_value_t = 10.0)]
    #[serde(default = "default_retrieval_similarity_threshold")]
    /// Distance cutoff; results further away than this are dropped. Too tight
    /// a threshold empties the result set for L2 on 1536-dim embeddings.
    pub retrieval_similarity_threshold: f32,

    #[clap(long, default_value_t = 0.85)]
    #[serde(default = "default_retrieval_dedup_threshold")]
    pub retrieval_dedup_threshold: f32,

    #[clap(long, default_value_t = 1000)]
    #[serde(default = "default_text_chunk_size")]
    pub text_chunk_size: usize,

    #[clap(long, default_value_t = 200)]
    #[serde(default = "default_text_chunk_overlap")]
    pub text_chunk_overlap: usize,

    #[clap(long, default_value_t = 100)]
    #[serde(default = "default_text_min_chunk_size")]
    pub text_min_chunk_size: usize,

    #[clap(long, default_value_t = 0.45)]
    #[serde(default = "default_confidence_w_retrieval")]
    pub confidence_w_retrieval: f32,

    #[clap(long, default_value_t = 0.25)]
    #[serde(default = "default_confidence_w_completeness")]
    pub confidence_w_completeness: f32,

    #[clap(long, default_value_t = 0.15)]
    #[serde(default = "default_confidence_w_keyword_match")]
    pub confidence_w_keyword_match: f32,

    #[clap(long, default_value_t = 0.10)]
    #[serde(default = "default_confidence_w_answer_quality")]
    pub confidence_w_answer_quality: f32,

    #[clap(long, default_value_t = 0.05)]
    #[serde(default = "default_confidence_w_consistency")]
    pub confidence_w_consistency: f32,

    #[clap(long, default_value_t = 10)]
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[clap(long, default_value_t = 60)]
    #[serde(default = "default_query_timeout_seconds")]
    pub query_timeout_seconds: u64,

    #[clap(long, default_value_t = 10_000)]
    #[serde(default = "default_embedding_cache_size")]
    pub embedding_cache_size: usize,

    #[clap(long, default_value_t = 86_400)]
    #[serde(default = "default_embedding_cache_ttl_secs")]
    pub embedding_cache_ttl_secs: u64,

    #[clap(long, default_value_t = 5_000)]
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,

    #[clap(long, default_value_t = 3_600)]
    #[serde(default = "default_query_cache_ttl_secs")]
    pub query_cache_ttl_secs: u64,

    #[clap(long, default_value_t = 2_000)]
    #[serde(default = "default_classifier_cache_size")]
    pub classifier_cache_size: usize,

    #[clap(long, default_value_t = 604_800)]
    #[serde(default = "default_classifier_cache_ttl_secs")]
    pub classifier_cache_ttl_secs: u64,

    #[clap(long, default_value_t = 1.0)]
    #[serde(default = "default_file_content_weight")]
    /// Score multiplier for attached-file context during retrieval fusion
    pub file_content_weight: f32,

    #[clap(long, default_value_t = 1.0)]
    #[serde(default = "default_kb_content_weight")]
    /// Score multiplier for knowledge-base context during retrieval fusion
    pub kb_content_weight: f32,

    #[clap(long, default_value_t = 24)]
    #[serde(default = "default_conversation_file_ttl_hours")]
    pub conversation_file_ttl_hours: u64,

    #[clap(long, default_value_t = 1024)]
    #[serde(default = "default_conversation_storage_quota_mb")]
    pub conversation_storage_quota_mb: u64,
}

impl Configuration {
    /// Directory where logs are written to
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("sql_db").join("kbrobot.db")
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.data_dir.join("vector_store")
    }

    /// Per-KB scratch area for preserved source copies and chunk dumps
    pub fn kb_temp_dir(&self, kb_id: &str) -> PathBuf {
        self.data_dir.join("kb_temp").join(kb_id)
    }

    pub fn conversation_temp_dir(&self) -> PathBuf {
        self.data_dir.join("conversation_temp")
    }

    pub fn confidence_weights(&self) -> crate::rag::confidence::ConfidenceWeights {
        crate::rag::confidence::ConfidenceWeights {
            retrieval: self.confidence_w_retrieval,
            completeness: self.confidence_w_completeness,
            keyword_match: self.confidence_w_keyword_match,
            answer_quality: self.confidence_w_answer_quality,
            consistency: self.confidence_w_consistency,
        }
    }
}

fn default_data_dir() -> PathBuf {
    match directories::ProjectDirs::from("ai", "kbrobot", "kbrobot") {
        Some(dirs) => dirs.data_dir().to_owned(),
        None => "kbrobot_data".into(),
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    42100
}

fn default_llm_api_base() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_owned()
}

fn default_llm_temperature() -> f32 {
    0.7
}

fn default_llm_max_tokens() -> usize {
    2000
}

fn default_embedding_api_base() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_owned()
}

fn default_embedding_dim() -> usize {
    1536
}

fn default_hnsw_max_elements() -> usize {
    1_000_000
}

fn default_hnsw_ef_construction() -> usize {
    200
}

fn default_hnsw_ef_search() -> usize {
    100
}

fn default_hnsw_m() -> usize {
    16
}

fn default_hnsw_distance_metric() -> String {
    "l2".to_owned()
}

fn default_rebuild_threshold() -> u64 {
    1000
}

fn default_retrieval_top_k() -> usize {
    5
}

fn default_retrieval_fetch_multiplier() -> usize {
    5
}

fn default_retrieval_similarity_threshold() -> f32 {
    10.0
}

fn default_retrieval_dedup_threshold() -> f32 {
    0.85
}

fn default_text_chunk_size() -> usize {
    1000
}

fn default_text_chunk_overlap() -> usize {
    200
}

fn default_text_min_chunk_size() -> usize {
    100
}

fn default_confidence_w_retrieval() -> f32 {
    0.45
}

fn default_confidence_w_completeness() -> f32 {
    0.25
}

fn default_confidence_w_keyword_match() -> f32 {
    0.15
}

fn default_confidence_w_answer_quality() -> f32 {
    0.10
}

fn default_confidence_w_consistency() -> f32 {
    0.05
}

fn default_max_iterations() -> u32 {
    10
}

fn default_query_timeout_seconds() -> u64 {
    60
}

fn default_embedding_cache_size() -> usize {
    10_000
}

fn default_embedding_cache_ttl_secs() -> u64 {
    86_400
}

fn default_query_cache_size() -> usize {
    5_000
}

fn default_query_cache_ttl_secs() -> u64 {
    3_600
}

fn default_classifier_cache_size() -> usize {
    2_000
}

fn default_classifier_cache_ttl_secs() -> u64 {
    604_800
}

fn default_file_content_weight() -> f32 {
    1.0
}

fn default_kb_content_weight() -> f32 {
    1.0
}

fn default_conversation_file_ttl_hours() -> u64 {
    24
}

fn default_conversation_storage_quota_mb() -> u64 {
    1024
}
