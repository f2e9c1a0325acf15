use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::application::application::Application;

pub async fn health(Extension(app): Extension<Application>) -> Json<Value> {
    let db_ok = sqlx::query("SELECT 1")
        .fetch_one(app.sql.as_ref())
        .await
        .is_ok();
    let store = app.vector_store.stats();

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "db": db_ok,
        "vectors": store.count,
    }))
}
