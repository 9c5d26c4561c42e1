use crate::error::ApiError;
use crate::extract::ApiPath;
use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use serde_json::Value;
use std::sync::Arc;
use tributary_core::Error;
use tributary_core::registry::{PluginInfo, SubTaskDescriptor};

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/plugins", get(list))
        .route("/plugins/{plugin}", get(info))
        .route("/plugins/{plugin}/subtasks", get(subtasks))
        .route("/plugins/{plugin}/openapi", get(open_api))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<PluginInfo>> {
    Json(state.registry.list())
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn info(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
) -> Result<Json<PluginInfo>, ApiError> {
    Ok(Json(state.registry.info(&plugin)?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn subtasks(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
) -> Result<Json<Vec<SubTaskDescriptor>>, ApiError> {
    Ok(Json(state.registry.info(&plugin)?.subtask_metas))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn open_api(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
) -> Result<Json<Value>, ApiError> {
    let p = state.registry.get(&plugin)?;
    let doc = p
        .open_api()
        .map(|o| o.open_api_fragment())
        .ok_or_else(|| Error::NotFound(format!("plugin {plugin} publishes no api document")))?;
    Ok(Json(doc))
}
