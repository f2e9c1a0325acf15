pub mod conversations;
pub mod health;
pub mod kb;
pub mod query;
pub mod types;

use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use tower_http::cors::CorsLayer;

use crate::application::application::Application;

pub fn router(app: Application) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/kb", post(kb::create_kb).get(kb::list_kbs))
        .route("/api/kb/:kb_id", get(kb::get_kb).delete(kb::delete_kb))
        .route("/api/kb/:kb_id/stats", get(kb::kb_stats))
        .route(
            "/api/kb/:kb_id/documents",
            post(kb::ingest_document).get(kb::list_documents),
        )
        .route("/api/documents/:doc_id", delete(kb::delete_document))
        .route("/api/query", post(query::run_query))
        .route("/api/cache/stats", get(query::cache_stats))
        .route("/api/vector-store/stats", get(query::store_stats))
        .route(
            "/api/conversations",
            post(conversations::create_conversation),
        )
        .route(
            "/api/conversations/:conversation_id",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .route(
            "/api/conversations/:conversation_id/messages",
            post(conversations::append_message).get(conversations::list_messages),
        )
        .route(
            "/api/conversations/:conversation_id/files",
            post(conversations::upload_file),
        )
        .layer(Extension(app))
        .layer(CorsLayer::permissive())
}

pub async fn start(app: Application) -> anyhow::Result<()> {
    let address = format!("{}:{}", app.config.host, app.config.port).parse()?;
    tracing::info!(%address, "webserver listening");
    axum::Server::bind(&address)
        .serve(router(app).into_make_service())
        .await?;
    Ok(())
}
