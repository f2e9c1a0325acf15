//! Document and chunk repositories. Writes that touch multiple tables go
//! through the transaction-scoped helpers so the ingest and delete paths
//! can keep the KB counters in the same commit.

use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, Transaction};

use super::sqlite::{now_rfc3339, DbError, SqlDb};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub kb_id: String,
    pub filename: String,
    pub file_path: Option<String>,
    pub chunk_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub kb_id: String,
    pub content: String,
    pub chunk_index: i64,
    pub vector_id: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> DocumentRecord {
    DocumentRecord {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        filename: row.get("filename"),
        file_path: row.get("file_path"),
        chunk_count: row.get("chunk_count"),
        created_at: row.get("created_at"),
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        id: row.get("id"),
        document_id: row.get("document_id"),
        kb_id: row.get("kb_id"),
        content: row.get("content"),
        chunk_index: row.get("chunk_index"),
        vector_id: row.get("vector_id"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

#[derive(Clone)]
pub struct DocumentRepository {
    db: SqlDb,
}

impl DocumentRepository {
    pub fn new(db: SqlDb) -> Self {
        Self { db }
    }

    pub async fn get(&self, doc_id: &str) -> Result<Option<DocumentRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    pub async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<DocumentRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM documents WHERE kb_id = ? ORDER BY created_at DESC")
            .bind(kb_id)
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    pub async fn insert(
        tx: &mut Transaction<'_, Sqlite>,
        doc_id: &str,
        kb_id: &str,
        filename: &str,
        file_path: Option<&str>,
        chunk_count: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO documents (id, kb_id, filename, file_path, chunk_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(doc_id)
        .bind(kb_id)
        .bind(filename)
        .bind(file_path)
        .bind(chunk_count)
        .bind(now_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn delete_row(tx: &mut Transaction<'_, Sqlite>, doc_id: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_kb(tx: &mut Transaction<'_, Sqlite>, kb_id: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM documents WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct ChunkRepository {
    db: SqlDb,
}

impl ChunkRepository {
    pub fn new(db: SqlDb) -> Self {
        Self { db }
    }

    pub async fn list_by_document(&self, doc_id: &str) -> Result<Vec<ChunkRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT * FROM text_chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(doc_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    pub async fn count_by_kb(&self, kb_id: &str) -> Result<i64, DbError> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM text_chunks WHERE kb_id = ?")
            .bind(kb_id)
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(row.get("n"))
    }

    pub async fn bulk_insert(
        tx: &mut Transaction<'_, Sqlite>,
        chunks: &[ChunkRecord],
    ) -> Result<(), DbError> {
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO text_chunks (id, document_id, kb_id, content, chunk_index, vector_id, metadata, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.kb_id)
            .bind(&chunk.content)
            .bind(chunk.chunk_index)
            .bind(&chunk.vector_id)
            .bind(&chunk.metadata)
            .bind(&chunk.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_by_document(
        tx: &mut Transaction<'_, Sqlite>,
        doc_id: &str,
    ) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM text_chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_kb(tx: &mut Transaction<'_, Sqlite>, kb_id: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM text_chunks WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}
