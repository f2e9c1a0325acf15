//! Ephemeral files attached to a conversation. Each file lands in a
//! per-conversation directory keyed by its content hash (re-uploads of the
//! same bytes dedupe for free), gets content-extracted on read, and never
//! enters the persistent chunk store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::chunking::text_chunker::clean_text;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv", "log", "json"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported attachment format: {0}")]
    UnsupportedFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structured record for images, flagged for the vision-capable LLM path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEnvelope {
    pub format: String,
    pub base64: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileContent {
    Text(String),
    Image(ImageEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFileInfo {
    pub file_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size: usize,
    pub stored_path: PathBuf,
    pub uploaded_at: String,
}

pub struct ConversationFileStore {
    base_dir: PathBuf,
    max_file_size: usize,
    max_content_length: usize,
}

impl ConversationFileStore {
    pub fn new(base_dir: PathBuf, max_file_size: usize, max_content_length: usize) -> Self {
        Self {
            base_dir,
            max_file_size,
            max_content_length,
        }
    }

    pub fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.base_dir.join(conversation_id)
    }

    pub fn save_file(
        &self,
        conversation_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredFileInfo, FileStoreError> {
        if bytes.len() > self.max_file_size {
            return Err(FileStoreError::TooLarge {
                size: bytes.len(),
                limit: self.max_file_size,
            });
        }

        let file_type = detect_file_type(filename);
        if file_type == "unknown" {
            return Err(FileStoreError::UnsupportedFormat(
                extension_of(filename).unwrap_or_default(),
            ));
        }

        let dir = self.conversation_dir(conversation_id);
        std::fs::create_dir_all(&dir)?;

        let file_id = blake3::hash(bytes).to_hex().to_string();
        let stored_path = dir.join(format!("{}_{}", &file_id[..16], sanitize_filename(filename)));

        if !stored_path.exists() {
            std::fs::write(&stored_path, bytes)?;
            info!(conversation_id, filename, bytes = bytes.len(), "attachment saved");
        }

        Ok(StoredFileInfo {
            file_id,
            filename: filename.to_owned(),
            file_type,
            file_size: bytes.len(),
            stored_path,
            uploaded_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Extract usable content from a stored attachment: cleaned, truncated
    /// text for the text family; a base64 envelope for images.
    pub fn extract_content(&self, path: &Path) -> Result<FileContent, FileStoreError> {
        let extension = extension_of_path(path);

        if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            let raw = std::fs::read_to_string(path)?;
            let mut cleaned = clean_text(&raw);
            if cleaned.chars().count() > self.max_content_length {
                cleaned = cleaned.chars().take(self.max_content_length).collect::<String>()
                    + "\n... [内容已截断]";
            }
            return Ok(FileContent::Text(cleaned));
        }

        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            let bytes = std::fs::read(path)?;
            return Ok(FileContent::Image(ImageEnvelope {
                format: extension,
                base64: base64::engine::general_purpose::STANDARD.encode(bytes),
                filename: path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            }));
        }

        Err(FileStoreError::UnsupportedFormat(extension))
    }

    /// Everything attached to a conversation, as `{filename -> content}`,
    /// ready for retrieval fusion. Files that fail extraction are skipped
    /// with a warning.
    pub fn collect_contents(&self, conversation_id: &str) -> HashMap<String, FileContent> {
        let dir = self.conversation_dir(conversation_id);
        let mut contents = HashMap::new();

        let Ok(entries) = std::fs::read_dir(&dir) else {
            return contents;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // stored as <hash16>_<original name>
            let stored_name = entry.file_name().to_string_lossy().into_owned();
            let original = stored_name
                .split_once('_')
                .map(|(_, rest)| rest.to_owned())
                .unwrap_or(stored_name);

            match self.extract_content(&path) {
                Ok(content) => {
                    contents.insert(original, content);
                }
                Err(e) => {
                    warn!(conversation_id, file = %path.display(), error = %e, "attachment extraction failed");
                }
            }
        }
        contents
    }

    pub fn cleanup_conversation(&self, conversation_id: &str) -> std::io::Result<usize> {
        let dir = self.conversation_dir(conversation_id);
        if !dir.exists() {
            return Ok(0);
        }
        let removed = std::fs::read_dir(&dir)?.count();
        std::fs::remove_dir_all(&dir)?;
        info!(conversation_id, removed, "conversation attachments removed");
        Ok(removed)
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

fn extension_of_path(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn detect_file_type(filename: &str) -> String {
    let Some(extension) = extension_of(filename) else {
        return "unknown".to_owned();
    };
    if TEXT_EXTENSIONS.contains(&extension.as_str()) {
        "text".to_owned()
    } else if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        "image".to_owned()
    } else {
        "unknown".to_owned()
    }
}

fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') || !c.is_ascii() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ConversationFileStore {
        ConversationFileStore::new(dir.to_path_buf(), 1024 * 1024, 100)
    }

    #[test]
    fn test_save_and_collect_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let info = store.save_file("conv1", "notes.txt", b"hello  world").unwrap();
        assert_eq!(info.file_type, "text");

        let contents = store.collect_contents("conv1");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents.get("notes.txt"), Some(&FileContent::Text("hello world".into())));
    }

    #[test]
    fn test_duplicate_bytes_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let first = store.save_file("conv1", "a.txt", b"same content").unwrap();
        let second = store.save_file("conv1", "a.txt", b"same content").unwrap();
        assert_eq!(first.file_id, second.file_id);
        assert_eq!(store.collect_contents("conv1").len(), 1);
    }

    #[test]
    fn test_long_text_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let long = "x".repeat(500);
        store.save_file("conv1", "big.txt", long.as_bytes()).unwrap();

        let contents = store.collect_contents("conv1");
        let FileContent::Text(text) = contents.get("big.txt").unwrap() else {
            panic!("expected text");
        };
        assert!(text.contains("[内容已截断]"));
        assert!(text.chars().count() < 500);
    }

    #[test]
    fn test_image_becomes_an_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store.save_file("conv1", "shot.png", &[0x89, 0x50, 0x4e, 0x47]).unwrap();
        let contents = store.collect_contents("conv1");
        let FileContent::Image(envelope) = contents.get("shot.png").unwrap() else {
            panic!("expected image");
        };
        assert_eq!(envelope.format, "png");
        assert!(!envelope.base64.is_empty());
    }

    #[test]
    fn test_oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationFileStore::new(dir.path().to_path_buf(), 4, 100);
        assert!(matches!(
            store.save_file("conv1", "big.txt", b"too big"),
            Err(FileStoreError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_unsupported_attachment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(
            store.save_file("conv1", "binary.exe", b"MZ"),
            Err(FileStoreError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_cleanup_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_file("conv1", "a.txt", b"content a").unwrap();
        store.save_file("conv1", "b.txt", b"content b").unwrap();

        assert_eq!(store.cleanup_conversation("conv1").unwrap(), 2);
        assert!(store.collect_contents("conv1").is_empty());
        assert_eq!(store.cleanup_conversation("conv1").unwrap(), 0);
    }
}
