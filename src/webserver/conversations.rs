use axum::extract::Path;
use axum::{Extension, Json};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use super::types::{EndpointError, Result};
use crate::application::application::Application;
use crate::db::conversations::NewMessage;

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub kb_id: Option<String>,
    pub title: Option<String>,
}

pub async fn create_conversation(
    Extension(app): Extension<Application>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<Json<Value>> {
    let kb_name = match request.kb_id.as_deref() {
        Some(kb_id) => app.kb_manager.get_kb(kb_id).await?.map(|kb| kb.name),
        None => None,
    };

    let conversation = app
        .conversations
        .create(
            request.kb_id.as_deref(),
            kb_name.as_deref(),
            request.title.as_deref(),
        )
        .await?;
    Ok(Json(json!(conversation)))
}

pub async fn get_conversation(
    Extension(app): Extension<Application>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>> {
    let conversation = app.conversations.get(&conversation_id).await?.ok_or_else(|| {
        EndpointError::not_found(format!("conversation not found: {}", conversation_id))
    })?;
    Ok(Json(json!(conversation)))
}

pub async fn delete_conversation(
    Extension(app): Extension<Application>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>> {
    let deleted = app.conversations.delete(&conversation_id).await?;
    if !deleted {
        return Err(EndpointError::not_found(format!(
            "conversation not found: {}",
            conversation_id
        )));
    }
    if let Err(e) = app.file_store.cleanup_conversation(&conversation_id) {
        tracing::warn!(conversation_id, error = %e, "attachment cleanup failed");
    }
    Ok(Json(json!({ "deleted": true })))
}

pub async fn append_message(
    Extension(app): Extension<Application>,
    Path(conversation_id): Path<String>,
    Json(message): Json<NewMessage>,
) -> Result<Json<Value>> {
    let stored = app.conversations.append_message(&conversation_id, message).await?;
    Ok(Json(json!(stored)))
}

pub async fn list_messages(
    Extension(app): Extension<Application>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>> {
    let messages = app.conversations.list_messages(&conversation_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Deserialize)]
pub struct UploadFileRequest {
    pub filename: String,
    /// Base64-encoded file bytes
    pub content: String,
}

pub async fn upload_file(
    Extension(app): Extension<Application>,
    Path(conversation_id): Path<String>,
    Json(request): Json<UploadFileRequest>,
) -> Result<Json<Value>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&request.content)
        .map_err(|e| EndpointError::user(format!("invalid base64 payload: {}", e)))?;

    let info = app
        .file_store
        .save_file(&conversation_id, &request.filename, &bytes)
        .map_err(|e| EndpointError::user(e.to_string()))?;
    Ok(Json(json!(info)))
}
