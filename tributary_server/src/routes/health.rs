use crate::server::AppState;
use axum::{Extension, Json};
use serde_json::{Value, json};
use std::sync::Arc;

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "plugins": state.registry.names(),
    }))
}
