//! Document loading for the ingest pipeline. Plain-text families are read
//! directly; proprietary binary formats go through pluggable extractors
//! that callers may register.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::embedder::EmbedderError;
use crate::vector_store::VectorStoreError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("knowledge base not found: {0}")]
    KbNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document produced no chunks: {0}")]
    EmptyDocument(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("vector store failed: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("database failed: {0}")]
    Db(#[from] crate::db::DbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary handed back to the caller after a successful ingest.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub kb_id: String,
    pub filename: String,
    pub preserved_path: Option<String>,
    pub chunk_count: usize,
    pub chunk_ids: Vec<String>,
    pub created_at: String,
}

/// Extracts plain text out of one file format family.
pub trait ContentExtractor: Send + Sync {
    fn extensions(&self) -> &[&str];
    fn extract(&self, path: &Path) -> Result<String, IngestError>;
}

struct PlainTextExtractor;

impl ContentExtractor for PlainTextExtractor {
    fn extensions(&self) -> &[&str] {
        &["txt", "md", "markdown", "csv", "log", "json"]
    }

    fn extract(&self, path: &Path) -> Result<String, IngestError> {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Extension-dispatching loader. Binary formats (pdf, docx, xlsx) have no
/// built-in extractor; hosts plug their own in through `register`.
pub struct DocumentLoader {
    extractors: HashMap<String, usize>,
    registered: Vec<Box<dyn ContentExtractor>>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        let mut loader = Self {
            extractors: HashMap::new(),
            registered: Vec::new(),
        };
        loader.register(Box::new(PlainTextExtractor));
        loader
    }
}

impl DocumentLoader {
    pub fn register(&mut self, extractor: Box<dyn ContentExtractor>) {
        let slot = self.registered.len();
        for extension in extractor.extensions() {
            self.extractors.insert(extension.to_lowercase(), slot);
        }
        self.registered.push(extractor);
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.extractors.contains_key(&extension_of(path))
    }

    pub fn load(&self, path: &Path) -> Result<String, IngestError> {
        let extension = extension_of(path);
        let slot = self
            .extractors
            .get(&extension)
            .ok_or_else(|| IngestError::UnsupportedFormat(extension.clone()))?;
        let content = self.registered[*slot].extract(path)?;
        info!(path = %path.display(), chars = content.len(), "document loaded");
        Ok(content)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Timestamped destination for the preserved source copy inside the KB's
/// temp directory.
pub fn preserved_copy_path(kb_temp_dir: &Path, source: &Path) -> PathBuf {
    let filename = source
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_owned());
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    kb_temp_dir.join(format!("{}_{}", stamp, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_plain_text_family_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "# heading\nbody text").unwrap();

        let loader = DocumentLoader::default();
        assert!(loader.supports(&path));
        assert_eq!(loader.load(&path).unwrap(), "# heading\nbody text");
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let loader = DocumentLoader::default();
        let path = Path::new("report.docx");
        assert!(!loader.supports(path));
        assert!(matches!(
            loader.load(path),
            Err(IngestError::UnsupportedFormat(ext)) if ext == "docx"
        ));
    }

    #[test]
    fn test_registered_extractor_takes_over() {
        struct FakePdf;
        impl ContentExtractor for FakePdf {
            fn extensions(&self) -> &[&str] {
                &["pdf"]
            }
            fn extract(&self, _path: &Path) -> Result<String, IngestError> {
                Ok("extracted pdf text".to_owned())
            }
        }

        let mut loader = DocumentLoader::default();
        loader.register(Box::new(FakePdf));
        assert_eq!(loader.load(Path::new("x.pdf")).unwrap(), "extracted pdf text");
    }
}
