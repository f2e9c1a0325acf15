use axum::extract::Path;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::types::{EndpointError, Result};
use crate::application::application::Application;
use crate::kb::manager::IngestOptions;

#[derive(Deserialize)]
pub struct CreateKbRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn create_kb(
    Extension(app): Extension<Application>,
    Json(request): Json<CreateKbRequest>,
) -> Result<Json<Value>> {
    let kb = app
        .kb_manager
        .create_kb(&request.name, request.description.as_deref(), &request.tags)
        .await?;
    Ok(Json(json!(kb)))
}

pub async fn list_kbs(Extension(app): Extension<Application>) -> Result<Json<Value>> {
    let kbs = app.kb_manager.list_kbs().await?;
    Ok(Json(json!({ "knowledge_bases": kbs })))
}

pub async fn get_kb(
    Extension(app): Extension<Application>,
    Path(kb_id): Path<String>,
) -> Result<Json<Value>> {
    let kb = app
        .kb_manager
        .get_kb(&kb_id)
        .await?
        .ok_or_else(|| EndpointError::not_found(format!("knowledge base not found: {}", kb_id)))?;
    Ok(Json(json!(kb)))
}

pub async fn kb_stats(
    Extension(app): Extension<Application>,
    Path(kb_id): Path<String>,
) -> Result<Json<Value>> {
    let stats = app.kb_manager.kb_stats(&kb_id).await?;
    Ok(Json(json!(stats)))
}

pub async fn delete_kb(
    Extension(app): Extension<Application>,
    Path(kb_id): Path<String>,
) -> Result<Json<Value>> {
    let deleted = app.kb_manager.delete_kb(&kb_id).await?;
    if !deleted {
        return Err(EndpointError::not_found(format!(
            "knowledge base not found: {}",
            kb_id
        )));
    }
    Ok(Json(json!({ "deleted": true, "kb_id": kb_id })))
}

#[derive(Deserialize)]
pub struct IngestRequest {
    pub file_path: String,
    pub metadata: Option<Value>,
    #[serde(default)]
    pub persist_chunks: bool,
}

pub async fn ingest_document(
    Extension(app): Extension<Application>,
    Path(kb_id): Path<String>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<Value>> {
    let options = IngestOptions {
        persist_chunks: request.persist_chunks,
        ..Default::default()
    };
    let summary = app
        .kb_manager
        .ingest_document(
            &kb_id,
            std::path::Path::new(&request.file_path),
            request.metadata,
            options,
        )
        .await?;
    Ok(Json(json!(summary)))
}

pub async fn list_documents(
    Extension(app): Extension<Application>,
    Path(kb_id): Path<String>,
) -> Result<Json<Value>> {
    let documents = app.kb_manager.list_documents(&kb_id).await?;
    Ok(Json(json!({ "documents": documents })))
}

pub async fn delete_document(
    Extension(app): Extension<Application>,
    Path(doc_id): Path<String>,
) -> Result<Json<Value>> {
    app.kb_manager.delete_document(&doc_id).await?;
    Ok(Json(json!({ "deleted": true, "doc_id": doc_id })))
}
