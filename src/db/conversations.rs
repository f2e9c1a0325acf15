//! Conversation persistence. Messages cascade with their conversation;
//! appending a message bumps the counter and timestamp in one commit.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

use super::sqlite::{now_rfc3339, DbError, SqlDb};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub kb_id: Option<String>,
    pub kb_name: Option<String>,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
    pub confidence: Option<f64>,
    pub confidence_level: Option<String>,
    pub response_time_ms: Option<f64>,
    pub from_cache: bool,
    pub is_welcome: bool,
    pub error: Option<String>,
    pub retrieved_docs: Option<String>,
    pub metadata: Option<String>,
    pub uploaded_files: Option<String>,
    pub file_metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub confidence: Option<f64>,
    pub confidence_level: Option<String>,
    pub response_time_ms: Option<f64>,
    pub from_cache: bool,
    pub is_welcome: bool,
    pub error: Option<String>,
    pub retrieved_docs: Option<String>,
    pub metadata: Option<String>,
    pub uploaded_files: Option<String>,
    pub file_metadata: Option<String>,
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> ConversationRecord {
    ConversationRecord {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        kb_name: row.get("kb_name"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        message_count: row.get("message_count"),
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> MessageRecord {
    MessageRecord {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: row.get("role"),
        content: row.get("content"),
        timestamp: row.get("timestamp"),
        confidence: row.get("confidence"),
        confidence_level: row.get("confidence_level"),
        response_time_ms: row.get("response_time_ms"),
        from_cache: row.get::<i64, _>("from_cache") != 0,
        is_welcome: row.get::<i64, _>("is_welcome") != 0,
        error: row.get("error"),
        retrieved_docs: row.get("retrieved_docs"),
        metadata: row.get("metadata"),
        uploaded_files: row.get("uploaded_files"),
        file_metadata: row.get("file_metadata"),
    }
}

#[derive(Clone)]
pub struct ConversationRepository {
    db: SqlDb,
}

impl ConversationRepository {
    pub fn new(db: SqlDb) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        kb_id: Option<&str>,
        kb_name: Option<&str>,
        title: Option<&str>,
    ) -> Result<ConversationRecord, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();

        sqlx::query(
            "INSERT INTO conversations (id, kb_id, kb_name, title, created_at, updated_at, message_count) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&id)
        .bind(kb_id)
        .bind(kb_name)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        info!(conversation_id = %id, "conversation created");
        Ok(ConversationRecord {
            id,
            kb_id: kb_id.map(|s| s.to_owned()),
            kb_name: kb_name.map(|s| s.to_owned()),
            title: title.map(|s| s.to_owned()),
            created_at: now.clone(),
            updated_at: now,
            message_count: 0,
        })
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<ConversationRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        Ok(row.as_ref().map(row_to_conversation))
    }

    pub async fn list_by_kb(&self, kb_id: &str) -> Result<Vec<ConversationRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM conversations WHERE kb_id = ? ORDER BY updated_at DESC")
            .bind(kb_id)
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.iter().map(row_to_conversation).collect())
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<MessageRecord, DbError> {
        let existing = self.get(conversation_id).await?;
        if existing.is_none() {
            return Err(DbError::NotFound {
                entity: "conversation",
                id: conversation_id.to_owned(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO conversation_messages \
             (id, conversation_id, role, content, timestamp, confidence, confidence_level, \
              response_time_ms, from_cache, is_welcome, error, retrieved_docs, metadata, \
              uploaded_files, file_metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&now)
        .bind(message.confidence)
        .bind(&message.confidence_level)
        .bind(message.response_time_ms)
        .bind(message.from_cache as i64)
        .bind(message.is_welcome as i64)
        .bind(&message.error)
        .bind(&message.retrieved_docs)
        .bind(&message.metadata)
        .bind(&message.uploaded_files)
        .bind(&message.file_metadata)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET message_count = message_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(MessageRecord {
            id,
            conversation_id: conversation_id.to_owned(),
            role: message.role,
            content: message.content,
            timestamp: now,
            confidence: message.confidence,
            confidence_level: message.confidence_level,
            response_time_ms: message.response_time_ms,
            from_cache: message.from_cache,
            is_welcome: message.is_welcome,
            error: message.error,
            retrieved_docs: message.retrieved_docs,
            metadata: message.metadata,
            uploaded_files: message.uploaded_files,
            file_metadata: message.file_metadata,
        })
    }

    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_messages WHERE conversation_id = ? ORDER BY timestamp ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Delete a conversation and its messages. Returns false when the
    /// conversation did not exist.
    pub async fn delete(&self, conversation_id: &str) -> Result<bool, DbError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM conversation_messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
