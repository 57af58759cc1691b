//! Minimal echo service used to exercise supervisors and pipelines.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// `GET /health` reports the service name; `POST /` returns the posted object.
pub fn router(name: impl Into<String>) -> Router {
    let name: Arc<str> = Arc::from(name.into());

    Router::new()
        .route("/", axum::routing::post(echo))
        .route("/health", get(health_check))
        .with_state(name)
}

async fn health_check(State(name): State<Arc<str>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": &*name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn echo(Json(body): Json<Map<String, Value>>) -> Json<Map<String, Value>> {
    Json(body)
}
