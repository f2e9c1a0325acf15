//! Persistent HNSW vector store.
//!
//! Vectors live in a usearch graph addressed by monotonically increasing
//! integer labels. Deletion is lazy: a deleted label goes into a tombstone
//! set and keeps its slot in the graph until the tombstone count crosses
//! the rebuild threshold, at which point the index is compacted into a
//! fresh graph with dense zero-based labels.
//!
//! On-disk layout, under the store directory:
//!   hnsw.bin       binary index serialisation
//!   metadata.json  label -> envelope map, deletion_count, deleted_labels

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("index error: {0}")]
    Index(String),

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("capacity exhausted: adding {requested} would exceed max_elements {max_elements}")]
    CapacityExhausted { requested: usize, max_elements: usize },

    #[error("document and embedding counts do not match: {documents} vs {embeddings}")]
    LengthMismatch { documents: usize, embeddings: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    L2,
    Cosine,
    InnerProduct,
}

impl DistanceMetric {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "cosine" => DistanceMetric::Cosine,
            "ip" | "inner_product" => DistanceMetric::InnerProduct,
            // l2 / euclidean and anything unrecognised
            _ => DistanceMetric::L2,
        }
    }

    fn metric_kind(&self) -> MetricKind {
        match self {
            DistanceMetric::L2 => MetricKind::L2sq,
            DistanceMetric::Cosine => MetricKind::Cos,
            DistanceMetric::InnerProduct => MetricKind::IP,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::InnerProduct => "ip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HnswConfig {
    pub embedding_dim: usize,
    pub max_elements: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub m: usize,
    pub distance_metric: DistanceMetric,
    pub rebuild_threshold: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1536,
            max_elements: 1_000_000,
            ef_construction: 200,
            ef_search: 100,
            m: 16,
            distance_metric: DistanceMetric::L2,
            rebuild_threshold: 1000,
        }
    }
}

/// What a label maps to: the chunk it belongs to, its text, and the caller
/// supplied metadata bag. The text rides along so compaction can rebuild
/// without consulting the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEnvelope {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    /// Raw distance, smaller is better. Any distance-to-similarity
    /// transform is the caller's business.
    pub score: f32,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub deleted_count: usize,
    pub total_count: usize,
    pub deletion_count: u64,
    pub embedding_dim: usize,
    pub distance_metric: &'static str,
    pub max_elements: usize,
    pub rebuild_threshold: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedMetadata {
    metadata: HashMap<u64, VectorEnvelope>,
    deletion_count: u64,
    deleted_labels: Vec<u64>,
}

struct StoreInner {
    index: usearch::Index,
    envelopes: HashMap<u64, VectorEnvelope>,
    chunk_to_label: HashMap<String, u64>,
    label_counter: u64,
    tombstones: HashSet<u64>,
    deletion_count: u64,
}

impl StoreInner {
    fn live_count(&self) -> usize {
        self.envelopes.len()
    }

    fn slot_count(&self) -> usize {
        self.envelopes.len() + self.tombstones.len()
    }
}

/// Single-writer multi-reader persistent vector store. Searches share a
/// read lock; add, delete and rebuild take the write lock.
pub struct HnswStore {
    dir: PathBuf,
    config: HnswConfig,
    inner: RwLock<StoreInner>,
}

impl HnswStore {
    pub fn open(dir: impl AsRef<Path>, config: HnswConfig) -> Result<Self, VectorStoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_file = dir.join("hnsw.bin");
        let metadata_file = dir.join("metadata.json");

        let inner = match (index_file.exists(), metadata_file.exists()) {
            (true, true) => {
                let index = new_index(&config)?;
                index
                    .load(index_file.to_string_lossy().as_ref())
                    .map_err(|e| {
                        VectorStoreError::IndexCorruption(format!("failed to load hnsw.bin: {}", e))
                    })?;

                let raw = std::fs::read_to_string(&metadata_file)?;
                let persisted: PersistedMetadata = serde_json::from_str(&raw).map_err(|e| {
                    VectorStoreError::IndexCorruption(format!(
                        "failed to parse metadata.json: {}",
                        e
                    ))
                })?;

                // The counter must clear every label ever handed out,
                // including tombstoned ones still occupying graph slots;
                // otherwise a fresh add could collide with a tombstone.
                let max_live = persisted.metadata.keys().copied().max();
                let max_deleted = persisted.deleted_labels.iter().copied().max();
                let label_counter = max_live
                    .into_iter()
                    .chain(max_deleted)
                    .max()
                    .map(|max| max + 1)
                    .unwrap_or(0);
                let chunk_to_label = persisted
                    .metadata
                    .iter()
                    .map(|(label, envelope)| (envelope.id.clone(), *label))
                    .collect();

                info!(
                    records = persisted.metadata.len(),
                    deletion_count = persisted.deletion_count,
                    "loaded existing hnsw index"
                );

                StoreInner {
                    index,
                    envelopes: persisted.metadata,
                    chunk_to_label,
                    label_counter,
                    tombstones: persisted.deleted_labels.into_iter().collect(),
                    deletion_count: persisted.deletion_count,
                }
            }
            (false, false) => {
                info!(dim = config.embedding_dim, "created fresh hnsw index");
                StoreInner {
                    index: new_index(&config)?,
                    envelopes: HashMap::new(),
                    chunk_to_label: HashMap::new(),
                    label_counter: 0,
                    tombstones: HashSet::new(),
                    deletion_count: 0,
                }
            }
            (index_present, _) => {
                // One file without the other means a torn state we cannot
                // reason about; operator intervention required.
                return Err(VectorStoreError::IndexCorruption(format!(
                    "{} exists without its companion",
                    if index_present { "hnsw.bin" } else { "metadata.json" }
                )));
            }
        };

        Ok(Self {
            dir,
            config,
            inner: RwLock::new(inner),
        })
    }

    /// Insert `(text, vector, metadata)` triples under fresh labels and
    /// persist. Fails atomically when the batch would exceed `max_elements`.
    pub fn add_documents(
        &self,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadatas: Vec<serde_json::Value>,
        ids: Option<Vec<String>>,
    ) -> Result<Vec<String>, VectorStoreError> {
        if documents.is_empty() {
            warn!("add_documents called with an empty batch");
            return Ok(Vec::new());
        }
        if documents.len() != embeddings.len() {
            return Err(VectorStoreError::LengthMismatch {
                documents: documents.len(),
                embeddings: embeddings.len(),
            });
        }

        let ids = ids.unwrap_or_else(|| {
            documents
                .iter()
                .map(|_| uuid::Uuid::new_v4().to_string())
                .collect()
        });

        let mut inner = self.inner.write();

        if inner.slot_count() + documents.len() > self.config.max_elements {
            return Err(VectorStoreError::CapacityExhausted {
                requested: documents.len(),
                max_elements: self.config.max_elements,
            });
        }

        let needed = inner.index.size() + documents.len();
        if needed > inner.index.capacity() {
            inner
                .index
                .reserve(needed.max(1024))
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
        }

        let first_label = inner.label_counter;
        for (offset, embedding) in embeddings.iter().enumerate() {
            let label = first_label + offset as u64;
            inner
                .index
                .add(label, embedding)
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
        }

        for (offset, ((document, id), metadata)) in documents
            .into_iter()
            .zip(ids.iter())
            .zip(metadatas.into_iter())
            .enumerate()
        {
            let label = first_label + offset as u64;
            inner.envelopes.insert(
                label,
                VectorEnvelope {
                    id: id.clone(),
                    content: document,
                    metadata,
                },
            );
            inner.chunk_to_label.insert(id.clone(), label);
        }
        inner.label_counter = first_label + ids.len() as u64;

        self.persist(&inner)?;
        info!(added = ids.len(), total = inner.live_count(), "added documents to hnsw index");
        Ok(ids)
    }

    /// k-nearest search with tombstone filtering. Over-fetches to
    /// compensate for tombstoned slots and temporarily widens the search
    /// breadth when `k` is large relative to the configured `ef_search`.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>, VectorStoreError> {
        let inner = self.inner.read();

        let actual_k = top_k.min(inner.live_count());
        if actual_k == 0 {
            return Ok(Vec::new());
        }

        let recommended_ef = self.config.ef_search.max(actual_k * 10);
        let raised = recommended_ef > self.config.ef_search;
        if raised {
            let _ = inner.index.change_expansion_search(recommended_ef);
            debug!(from = self.config.ef_search, to = recommended_ef, "raised ef_search for large k");
        }

        let fetch = (actual_k * 2).min(inner.slot_count()).max(1);
        let matches = inner
            .index
            .search(query, fetch)
            .map_err(|e| VectorStoreError::Index(e.to_string()));

        if raised {
            let _ = inner.index.change_expansion_search(self.config.ef_search);
        }
        let matches = matches?;

        let mut results = Vec::with_capacity(actual_k);
        for (label, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if inner.tombstones.contains(label) {
                continue;
            }
            let Some(envelope) = inner.envelopes.get(label) else {
                continue;
            };
            results.push(SearchResult {
                id: envelope.id.clone(),
                content: envelope.content.clone(),
                score: *distance,
                metadata: envelope.metadata.clone(),
            });
            if results.len() >= actual_k {
                break;
            }
        }

        debug!(requested = top_k, returned = results.len(), "hnsw search finished");
        Ok(results)
    }

    /// Tombstone a single chunk. Returns false when the chunk is unknown.
    pub fn delete_document(&self, chunk_id: &str) -> Result<bool, VectorStoreError> {
        let mut inner = self.inner.write();

        let Some(label) = inner.chunk_to_label.remove(chunk_id) else {
            warn!(chunk_id, "delete of unknown chunk");
            return Ok(false);
        };

        inner.tombstones.insert(label);
        inner.envelopes.remove(&label);
        inner.deletion_count += 1;

        self.persist(&inner)?;
        info!(
            chunk_id,
            deletion_count = inner.deletion_count,
            threshold = self.config.rebuild_threshold,
            "tombstoned chunk"
        );

        self.maybe_rebuild(&mut inner)?;
        Ok(true)
    }

    /// Tombstone every vector whose metadata matches all `filter` keys by
    /// equality (typically `{"kb_id": ...}` or `{"doc_id": ...}`).
    pub fn delete_where(
        &self,
        filter: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<usize, VectorStoreError> {
        let mut inner = self.inner.write();

        let matching = inner
            .envelopes
            .iter()
            .filter(|(_, envelope)| {
                filter.iter().all(|(key, expected)| {
                    envelope.metadata.get(key).map(|v| v == expected).unwrap_or(false)
                })
            })
            .map(|(label, envelope)| (*label, envelope.id.clone()))
            .collect::<Vec<_>>();

        if matching.is_empty() {
            return Ok(0);
        }

        for (label, chunk_id) in &matching {
            inner.tombstones.insert(*label);
            inner.envelopes.remove(label);
            inner.chunk_to_label.remove(chunk_id);
        }
        inner.deletion_count += matching.len() as u64;

        self.persist(&inner)?;
        info!(
            deleted = matching.len(),
            deletion_count = inner.deletion_count,
            "tombstoned chunks by metadata filter"
        );

        self.maybe_rebuild(&mut inner)?;
        Ok(matching.len())
    }

    pub fn clear(&self) -> Result<(), VectorStoreError> {
        let mut inner = self.inner.write();
        inner.index = new_index(&self.config)?;
        inner.envelopes.clear();
        inner.chunk_to_label.clear();
        inner.label_counter = 0;
        inner.tombstones.clear();
        inner.deletion_count = 0;
        self.persist(&inner)?;
        info!("cleared hnsw index");
        Ok(())
    }

    /// Compaction: rebuild a fresh graph from the live set, physically
    /// dropping tombstoned slots. Long operation, keep it off the hot path.
    pub fn rebuild_index(&self) -> Result<(), VectorStoreError> {
        let mut inner = self.inner.write();
        self.rebuild_locked(&mut inner)
    }

    fn maybe_rebuild(&self, inner: &mut StoreInner) -> Result<(), VectorStoreError> {
        if inner.deletion_count >= self.config.rebuild_threshold {
            warn!(
                deletion_count = inner.deletion_count,
                threshold = self.config.rebuild_threshold,
                "tombstone threshold crossed, rebuilding index"
            );
            self.rebuild_locked(inner)?;
        }
        Ok(())
    }

    fn rebuild_locked(&self, inner: &mut StoreInner) -> Result<(), VectorStoreError> {
        let started = Instant::now();
        let dim = self.config.embedding_dim;

        // Stable order keeps the new labels deterministic
        let mut live = inner
            .envelopes
            .iter()
            .filter(|(label, _)| !inner.tombstones.contains(label))
            .map(|(label, envelope)| (*label, envelope.clone()))
            .collect::<Vec<_>>();
        live.sort_by_key(|(label, _)| *label);

        let mut vectors = Vec::with_capacity(live.len());
        let mut envelopes = Vec::with_capacity(live.len());
        for (label, envelope) in live {
            let mut buffer = vec![0.0f32; dim];
            match inner.index.get(label, &mut buffer) {
                Ok(found) if found > 0 => {
                    vectors.push(buffer);
                    envelopes.push(envelope);
                }
                Ok(_) => {
                    // The vector is gone from the graph; the record is lost
                    // but compaction must carry on.
                    warn!(label, "vector missing during rebuild, skipping");
                }
                Err(e) => {
                    warn!(label, error = %e, "failed to extract vector during rebuild, skipping");
                }
            }
        }

        let new_index = new_index(&self.config)?;
        if !vectors.is_empty() {
            new_index
                .reserve(vectors.len().max(1024))
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
        }

        let mut new_envelopes = HashMap::with_capacity(envelopes.len());
        let mut new_chunk_to_label = HashMap::with_capacity(envelopes.len());
        for (new_label, (vector, envelope)) in vectors.iter().zip(envelopes.into_iter()).enumerate()
        {
            let new_label = new_label as u64;
            new_index
                .add(new_label, vector)
                .map_err(|e| VectorStoreError::Index(e.to_string()))?;
            new_chunk_to_label.insert(envelope.id.clone(), new_label);
            new_envelopes.insert(new_label, envelope);
        }

        let reclaimed = inner.deletion_count;
        inner.index = new_index;
        inner.label_counter = new_envelopes.len() as u64;
        inner.envelopes = new_envelopes;
        inner.chunk_to_label = new_chunk_to_label;
        inner.tombstones.clear();
        inner.deletion_count = 0;

        self.persist(inner)?;
        info!(
            live = inner.live_count(),
            reclaimed,
            elapsed_ms = started.elapsed().as_millis(),
            "index rebuild finished"
        );
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            count: inner.live_count(),
            deleted_count: inner.tombstones.len(),
            total_count: inner.slot_count(),
            deletion_count: inner.deletion_count,
            embedding_dim: self.config.embedding_dim,
            distance_metric: self.config.distance_metric.as_str(),
            max_elements: self.config.max_elements,
            rebuild_threshold: self.config.rebuild_threshold,
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live_count()
    }

    pub fn deletion_count(&self) -> u64 {
        self.inner.read().deletion_count
    }

    pub fn contains_chunk(&self, chunk_id: &str) -> bool {
        self.inner.read().chunk_to_label.contains_key(chunk_id)
    }

    /// Write both files through temporaries so a crash leaves either the
    /// old pair or the new pair, never a torn one.
    fn persist(&self, inner: &StoreInner) -> Result<(), VectorStoreError> {
        let index_file = self.dir.join("hnsw.bin");
        let index_tmp = self.dir.join("hnsw.bin.tmp");
        inner
            .index
            .save(index_tmp.to_string_lossy().as_ref())
            .map_err(|e| VectorStoreError::Index(e.to_string()))?;
        std::fs::rename(&index_tmp, &index_file)?;

        let metadata_file = self.dir.join("metadata.json");
        let metadata_tmp = self.dir.join("metadata.json.tmp");
        let persisted = PersistedMetadata {
            metadata: inner.envelopes.clone(),
            deletion_count: inner.deletion_count,
            deleted_labels: inner.tombstones.iter().copied().collect(),
        };
        std::fs::write(&metadata_tmp, serde_json::to_vec(&persisted)?)?;
        std::fs::rename(&metadata_tmp, &metadata_file)?;

        debug!("hnsw index persisted");
        Ok(())
    }
}

fn new_index(config: &HnswConfig) -> Result<usearch::Index, VectorStoreError> {
    let options = IndexOptions {
        dimensions: config.embedding_dim,
        metric: config.distance_metric.metric_kind(),
        quantization: ScalarKind::F32,
        connectivity: config.m,
        expansion_add: config.ef_construction,
        expansion_search: config.ef_search,
        multi: false,
    };
    let index = usearch::Index::new(&options).map_err(|e| {
        error!(error = %e, "failed to create usearch index");
        VectorStoreError::Index(e.to_string())
    })?;
    index
        .reserve(1024)
        .map_err(|e| VectorStoreError::Index(e.to_string()))?;
    Ok(index)
}
