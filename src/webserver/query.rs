use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::types::Result;
use crate::agent::graph::QueryOptions;
use crate::application::application::Application;

#[derive(Deserialize)]
pub struct QueryRequest {
    pub kb_id: String,
    pub question: String,
    pub top_k: Option<usize>,
    /// Fuse attached files from this conversation into the context
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub skip_cache: bool,
}

pub async fn run_query(
    Extension(app): Extension<Application>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Value>> {
    let file_contents = request
        .conversation_id
        .as_deref()
        .map(|conversation_id| app.file_store.collect_contents(conversation_id))
        .unwrap_or_default();

    let options = QueryOptions {
        top_k: request.top_k,
        file_contents,
        skip_cache: request.skip_cache,
    };

    let response = app
        .orchestrator
        .execute_query(&request.kb_id, &request.question, options)
        .await;
    Ok(Json(json!(response)))
}

pub async fn cache_stats(Extension(app): Extension<Application>) -> Json<Value> {
    Json(json!({ "caches": app.caches.stats() }))
}

pub async fn store_stats(Extension(app): Extension<Application>) -> Json<Value> {
    Json(json!(app.vector_store.stats()))
}
