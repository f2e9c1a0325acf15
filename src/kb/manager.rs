//! Knowledge base manager: KB lifecycle, document ingest, retrieval, and
//! the cascade deletes that keep the relational rows, the vector store and
//! the on-disk scratch files in step.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use super::ingest::{preserved_copy_path, DocumentLoader, DocumentSummary, IngestError};
use super::postprocess::{ProcessedResult, RetrievalPostProcessor};
use crate::agent::prompts::classify_question;
use crate::cache::tiers::QuestionClassification;
use crate::cache::CacheManager;
use crate::chunking::TextChunker;
use crate::db::documents::{ChunkRecord, ChunkRepository, DocumentRepository};
use crate::db::kb::{KbRepository, KbStats, KnowledgeBase};
use crate::db::sqlite::now_rfc3339;
use crate::db::{DbError, SqlDb};
use crate::embedder::Embedder;
use crate::vector_store::HnswStore;

#[derive(Debug, Clone)]
pub struct KbSettings {
    pub retrieval_top_k: usize,
    pub retrieval_fetch_multiplier: usize,
    pub retrieval_similarity_threshold: f32,
    pub temp_dir_base: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Preserve a timestamped copy of the source file in the KB temp dir
    pub preserve_source: bool,
    /// Dump each chunk's text under `<kb temp dir>/chunks/`
    pub persist_chunks: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            preserve_source: true,
            persist_chunks: false,
        }
    }
}

pub struct KnowledgeBaseManager {
    db: SqlDb,
    kb_repo: KbRepository,
    doc_repo: DocumentRepository,
    chunk_repo: ChunkRepository,
    store: Arc<HnswStore>,
    embedder: Arc<dyn Embedder>,
    chunker: TextChunker,
    loader: DocumentLoader,
    caches: Arc<CacheManager>,
    settings: KbSettings,
}

impl KnowledgeBaseManager {
    pub fn new(
        db: SqlDb,
        store: Arc<HnswStore>,
        embedder: Arc<dyn Embedder>,
        chunker: TextChunker,
        caches: Arc<CacheManager>,
        settings: KbSettings,
    ) -> Self {
        Self {
            kb_repo: KbRepository::new(db.clone()),
            doc_repo: DocumentRepository::new(db.clone()),
            chunk_repo: ChunkRepository::new(db.clone()),
            db,
            store,
            embedder,
            chunker,
            loader: DocumentLoader::default(),
            caches,
            settings,
        }
    }

    pub fn loader_mut(&mut self) -> &mut DocumentLoader {
        &mut self.loader
    }

    pub fn vector_store(&self) -> &Arc<HnswStore> {
        &self.store
    }

    pub async fn create_kb(
        &self,
        name: &str,
        description: Option<&str>,
        tags: &[String],
    ) -> Result<KnowledgeBase, DbError> {
        self.kb_repo.create(name, description, tags).await
    }

    pub async fn get_kb(&self, kb_id: &str) -> Result<Option<KnowledgeBase>, DbError> {
        self.kb_repo.get(kb_id).await
    }

    pub async fn list_kbs(&self) -> Result<Vec<KnowledgeBase>, DbError> {
        self.kb_repo.list().await
    }

    pub async fn kb_stats(&self, kb_id: &str) -> Result<KbStats, DbError> {
        self.kb_repo.stats(kb_id).await
    }

    pub async fn list_documents(
        &self,
        kb_id: &str,
    ) -> Result<Vec<crate::db::documents::DocumentRecord>, DbError> {
        self.doc_repo.list_by_kb(kb_id).await
    }

    /// Ingest one document: preserve a source copy, load, chunk, embed,
    /// then write vectors and relational rows. All-or-nothing per
    /// document: a failed relational commit rolls the fresh vectors back.
    pub async fn ingest_document(
        &self,
        kb_id: &str,
        file_path: &std::path::Path,
        user_metadata: Option<serde_json::Value>,
        options: IngestOptions,
    ) -> Result<DocumentSummary, IngestError> {
        if !self.kb_repo.exists(kb_id).await? {
            return Err(IngestError::KbNotFound(kb_id.to_owned()));
        }

        let filename = file_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_owned());
        info!(kb_id, filename, "ingesting document");

        let preserved_path = if options.preserve_source {
            let temp_dir = self.settings.temp_dir_base.join(kb_id);
            std::fs::create_dir_all(&temp_dir)?;
            let destination = preserved_copy_path(&temp_dir, file_path);
            std::fs::copy(file_path, &destination)?;
            Some(destination)
        } else {
            None
        };

        let content = self.loader.load(file_path)?;
        let chunks = self.chunker.chunk(&content);
        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument(filename));
        }

        // One provider call at most; full cache hits make it zero
        let embeddings = self.embedder.batch_embed(&chunks).await?;

        let doc_id = uuid::Uuid::new_v4().to_string();
        let chunk_ids = chunks
            .iter()
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect::<Vec<_>>();

        let metadatas = chunks
            .iter()
            .enumerate()
            .map(|(index, _)| {
                let mut envelope = json!({
                    "kb_id": kb_id,
                    "doc_id": doc_id,
                    "chunk_index": index,
                    "filename": filename,
                });
                if let (Some(base), Some(user)) =
                    (envelope.as_object_mut(), user_metadata.as_ref().and_then(|m| m.as_object()))
                {
                    for (key, value) in user {
                        base.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                envelope
            })
            .collect::<Vec<_>>();

        self.store.add_documents(
            chunks.clone(),
            embeddings,
            metadatas,
            Some(chunk_ids.clone()),
        )?;

        let relational = self
            .write_ingest_rows(kb_id, &doc_id, &filename, preserved_path.as_deref(), &chunks, &chunk_ids)
            .await;

        if let Err(e) = relational {
            // the vectors went in first, take them back out
            error!(kb_id, doc_id, error = %e, "relational write failed, rolling back vectors");
            let mut filter = serde_json::Map::new();
            filter.insert("doc_id".to_owned(), json!(doc_id));
            if let Err(rollback) = self.store.delete_where(&filter) {
                error!(doc_id, error = %rollback, "vector rollback failed");
            }
            return Err(e.into());
        }

        if options.persist_chunks {
            if let Err(e) = self.persist_chunk_files(kb_id, &doc_id, &chunks) {
                warn!(doc_id, error = %e, "failed to persist chunk files");
            }
        }

        info!(kb_id, doc_id, chunks = chunks.len(), "document ingested");
        Ok(DocumentSummary {
            id: doc_id,
            kb_id: kb_id.to_owned(),
            filename,
            preserved_path: preserved_path.map(|p| p.to_string_lossy().into_owned()),
            chunk_count: chunks.len(),
            chunk_ids,
            created_at: now_rfc3339(),
        })
    }

    async fn write_ingest_rows(
        &self,
        kb_id: &str,
        doc_id: &str,
        filename: &str,
        preserved_path: Option<&std::path::Path>,
        chunks: &[String],
        chunk_ids: &[String],
    ) -> Result<(), DbError> {
        let mut tx = self.db.begin().await?;

        DocumentRepository::insert(
            &mut tx,
            doc_id,
            kb_id,
            filename,
            preserved_path.map(|p| p.to_string_lossy()).as_deref(),
            chunks.len() as i64,
        )
        .await?;

        let rows = chunks
            .iter()
            .zip(chunk_ids.iter())
            .enumerate()
            .map(|(index, (content, chunk_id))| ChunkRecord {
                id: chunk_id.clone(),
                document_id: doc_id.to_owned(),
                kb_id: kb_id.to_owned(),
                content: content.clone(),
                chunk_index: index as i64,
                vector_id: Some(chunk_id.clone()),
                metadata: Some(
                    json!({ "kb_id": kb_id, "doc_id": doc_id, "chunk_index": index, "filename": filename })
                        .to_string(),
                ),
                created_at: now_rfc3339(),
            })
            .collect::<Vec<_>>();
        ChunkRepository::bulk_insert(&mut tx, &rows).await?;

        KbRepository::apply_ingest_counters(&mut tx, kb_id, chunks.len() as i64).await?;

        tx.commit().await?;
        Ok(())
    }

    fn persist_chunk_files(
        &self,
        kb_id: &str,
        doc_id: &str,
        chunks: &[String],
    ) -> std::io::Result<()> {
        let chunk_dir = self.settings.temp_dir_base.join(kb_id).join("chunks");
        std::fs::create_dir_all(&chunk_dir)?;
        for (index, chunk) in chunks.iter().enumerate() {
            std::fs::write(chunk_dir.join(format!("{}_{}.txt", doc_id, index)), chunk)?;
        }
        Ok(())
    }

    /// Search one knowledge base: classify (cached), embed (cached),
    /// over-fetch from the vector store, then post-process down to top_k.
    pub async fn search(
        &self,
        kb_id: &str,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<ProcessedResult>, IngestError> {
        let top_k = top_k.unwrap_or(self.settings.retrieval_top_k);
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        if self.caches.classifier.get_classification(query).is_none() {
            self.caches.classifier.set_classification(
                query,
                QuestionClassification {
                    question_type: classify_question(query).as_str().to_owned(),
                    classified_at: now_rfc3339(),
                },
            );
        }

        let query_embedding = self.embedder.embed(query).await?;

        let fetch = (top_k * self.settings.retrieval_fetch_multiplier).max(15);
        let raw = self.store.search(&query_embedding, fetch)?;

        let processor =
            RetrievalPostProcessor::new(self.settings.retrieval_similarity_threshold, top_k);
        Ok(processor.process(raw, kb_id, Some(query)))
    }

    /// Delete a document everywhere: rows, counters, vectors, preserved
    /// files. Returns `DocumentNotFound` when the row does not exist, so a
    /// repeated delete is a clean no-op for the caller.
    pub async fn delete_document(&self, doc_id: &str) -> Result<(), IngestError> {
        let Some(document) = self.doc_repo.get(doc_id).await? else {
            return Err(IngestError::DocumentNotFound(doc_id.to_owned()));
        };

        let mut tx = self.db.begin().await.map_err(DbError::Sqlx)?;
        let chunks_deleted = ChunkRepository::delete_by_document(&mut tx, doc_id).await?;
        DocumentRepository::delete_row(&mut tx, doc_id).await?;
        KbRepository::apply_document_delete_counters(&mut tx, &document.kb_id, document.chunk_count)
            .await?;
        tx.commit().await.map_err(DbError::Sqlx)?;

        let mut filter = serde_json::Map::new();
        filter.insert("doc_id".to_owned(), json!(doc_id));
        match self.store.delete_where(&filter) {
            Ok(vectors) => info!(doc_id, chunks_deleted, vectors, "document deleted"),
            Err(e) => warn!(doc_id, error = %e, "vector delete failed, tombstones out of step until compaction"),
        }

        self.cleanup_document_files(&document.kb_id, doc_id, document.file_path.as_deref());
        self.caches.query.clear_kb(&document.kb_id);
        Ok(())
    }

    /// Cascade-delete a knowledge base. The relational rows go first in
    /// one transaction; vector and file cleanup are idempotent best-effort
    /// steps that log on failure but never resurrect the KB row.
    pub async fn delete_kb(&self, kb_id: &str) -> Result<bool, IngestError> {
        if self.kb_repo.get(kb_id).await?.is_none() {
            return Ok(false);
        }

        let documents = self.doc_repo.list_by_kb(kb_id).await.unwrap_or_default();

        let mut tx = self.db.begin().await.map_err(DbError::Sqlx)?;
        let chunks_deleted = ChunkRepository::delete_by_kb(&mut tx, kb_id).await?;
        let docs_deleted = DocumentRepository::delete_by_kb(&mut tx, kb_id).await?;
        KbRepository::delete_row(&mut tx, kb_id).await?;
        tx.commit().await.map_err(DbError::Sqlx)?;

        let mut filter = serde_json::Map::new();
        filter.insert("kb_id".to_owned(), json!(kb_id));
        let vectors_deleted = match self.store.delete_where(&filter) {
            Ok(n) => n,
            Err(e) => {
                warn!(kb_id, error = %e, "vector delete failed during kb cascade");
                0
            }
        };

        let temp_dir = self.settings.temp_dir_base.join(kb_id);
        if temp_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&temp_dir) {
                warn!(kb_id, error = %e, "failed to remove kb temp dir");
            }
        }

        for document in &documents {
            self.cleanup_document_files(kb_id, &document.id, document.file_path.as_deref());
        }

        self.caches.query.clear_kb(kb_id);
        info!(
            kb_id,
            docs_deleted, chunks_deleted, vectors_deleted, "knowledge base deleted"
        );
        Ok(true)
    }

    fn cleanup_document_files(&self, kb_id: &str, doc_id: &str, preserved: Option<&str>) {
        if let Some(preserved) = preserved {
            let path = std::path::Path::new(preserved);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(doc_id, error = %e, "failed to remove preserved source copy");
                }
            }
        }

        let chunk_dir = self.settings.temp_dir_base.join(kb_id).join("chunks");
        let Ok(entries) = std::fs::read_dir(&chunk_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(doc_id) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(doc_id, error = %e, "failed to remove chunk file");
                }
            }
        }
    }
}
