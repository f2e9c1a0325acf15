//! Knowledge base repository. The `document_count` / `total_chunks`
//! aggregates on the row are maintained inside the same transaction as the
//! document and chunk writes, never out of band.

use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, Transaction};
use tracing::info;

use super::sqlite::{now_rfc3339, DbError, SqlDb};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub document_count: i64,
    pub total_chunks: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub kb_id: String,
    pub name: String,
    pub document_count: i64,
    pub total_chunks: i64,
}

fn row_to_kb(row: &sqlx::sqlite::SqliteRow) -> KnowledgeBase {
    let tags: Option<String> = row.get("tags");
    KnowledgeBase {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        tags: tags
            .map(|t| {
                t.split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_owned())
                    .collect()
            })
            .unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        document_count: row.get("document_count"),
        total_chunks: row.get("total_chunks"),
    }
}

#[derive(Clone)]
pub struct KbRepository {
    db: SqlDb,
}

impl KbRepository {
    pub fn new(db: SqlDb) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        tags: &[String],
    ) -> Result<KnowledgeBase, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let tags_joined = tags.join(",");

        let result = sqlx::query(
            "INSERT INTO knowledge_bases (id, name, description, tags, created_at, updated_at, document_count, total_chunks) \
             VALUES (?, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(&tags_joined)
        .bind(&now)
        .bind(&now)
        .execute(self.db.as_ref())
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                return Err(DbError::NameTaken(name.to_owned()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(kb_id = %id, name, "knowledge base created");
        Ok(KnowledgeBase {
            id,
            name: name.to_owned(),
            description: description.map(|d| d.to_owned()),
            tags: tags.to_vec(),
            created_at: now.clone(),
            updated_at: now,
            document_count: 0,
            total_chunks: 0,
        })
    }

    pub async fn get(&self, kb_id: &str) -> Result<Option<KnowledgeBase>, DbError> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        Ok(row.as_ref().map(row_to_kb))
    }

    pub async fn list(&self) -> Result<Vec<KnowledgeBase>, DbError> {
        let rows = sqlx::query("SELECT * FROM knowledge_bases ORDER BY created_at DESC")
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.iter().map(row_to_kb).collect())
    }

    pub async fn exists(&self, kb_id: &str) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT id FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        Ok(row.is_some())
    }

    /// Aggregate stats recomputed from the document rows, independent of
    /// the cached counters on the KB row.
    pub async fn stats(&self, kb_id: &str) -> Result<KbStats, DbError> {
        let kb = self.get(kb_id).await?.ok_or_else(|| DbError::NotFound {
            entity: "knowledge base",
            id: kb_id.to_owned(),
        })?;

        let row = sqlx::query(
            "SELECT COUNT(*) as doc_count, COALESCE(SUM(chunk_count), 0) as total_chunks \
             FROM documents WHERE kb_id = ?",
        )
        .bind(kb_id)
        .fetch_one(self.db.as_ref())
        .await?;

        Ok(KbStats {
            kb_id: kb_id.to_owned(),
            name: kb.name,
            document_count: row.get("doc_count"),
            total_chunks: row.get("total_chunks"),
        })
    }

    pub async fn apply_ingest_counters(
        tx: &mut Transaction<'_, Sqlite>,
        kb_id: &str,
        chunk_count: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE knowledge_bases \
             SET document_count = document_count + 1, \
                 total_chunks = total_chunks + ?, \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(now_rfc3339())
        .bind(kb_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn apply_document_delete_counters(
        tx: &mut Transaction<'_, Sqlite>,
        kb_id: &str,
        chunk_count: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE knowledge_bases \
             SET document_count = document_count - 1, \
                 total_chunks = total_chunks - ?, \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(now_rfc3339())
        .bind(kb_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn delete_row(tx: &mut Transaction<'_, Sqlite>, kb_id: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }
}
