//! Connection, scope and scope-config CRUD under `/plugins/{plugin}`.

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tributary_core::sources::{
    Connection, ConnectionInput, PurgeReport, Scope, ScopeConfig, ScopeConfigInput, ScopeInput,
};
use tributary_core::{ConnectionId, ScopeConfigId};

#[derive(Debug, Deserialize)]
pub struct SaveScopesRequest {
    pub data: Vec<ScopeInput>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteScopeParams {
    /// Purge collected data but keep the scope row and its blueprint references.
    pub delete_data_only: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/plugins/{plugin}/connections",
            get(list_connections).post(create_connection),
        )
        .route(
            "/plugins/{plugin}/connections/{id}",
            get(get_connection).patch(update_connection).delete(delete_connection),
        )
        .route(
            "/plugins/{plugin}/connections/{id}/scopes",
            get(list_scopes).put(save_scopes),
        )
        // scope ids may contain slashes (`owner/repo`)
        .route(
            "/plugins/{plugin}/connections/{id}/scopes/{*scope_id}",
            get(get_scope).delete(delete_scope),
        )
        .route(
            "/plugins/{plugin}/scope-configs",
            get(list_scope_configs).post(create_scope_config),
        )
        .route(
            "/plugins/{plugin}/scope-configs/{id}",
            get(get_scope_config).patch(update_scope_config).delete(delete_scope_config),
        )
}

// connections

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_connections(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
) -> Result<Json<Vec<Connection>>, ApiError> {
    Ok(Json(state.sources.list_connections(&plugin).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_connection(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ConnectionId)>,
) -> Result<Json<Connection>, ApiError> {
    Ok(Json(state.sources.get_connection(&plugin, id).await?.sanitized()))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create_connection(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
    ApiJson(input): ApiJson<ConnectionInput>,
) -> Result<(StatusCode, Json<Connection>), ApiError> {
    let conn = state.sources.save_connection(&plugin, None, input).await?;
    Ok((StatusCode::CREATED, Json(conn)))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn update_connection(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ConnectionId)>,
    ApiJson(input): ApiJson<ConnectionInput>,
) -> Result<Json<Connection>, ApiError> {
    Ok(Json(state.sources.save_connection(&plugin, Some(id), input).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn delete_connection(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ConnectionId)>,
) -> Result<Json<Connection>, ApiError> {
    Ok(Json(state.sources.delete_connection(&plugin, id).await?))
}

// scopes

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_scopes(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ConnectionId)>,
) -> Result<Json<Vec<Scope>>, ApiError> {
    Ok(Json(state.sources.list_scopes(&plugin, id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn save_scopes(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ConnectionId)>,
    ApiJson(req): ApiJson<SaveScopesRequest>,
) -> Result<Json<Vec<Scope>>, ApiError> {
    Ok(Json(state.sources.save_scopes(&plugin, id, req.data).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_scope(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id, scope_id)): ApiPath<(String, ConnectionId, String)>,
) -> Result<Json<Scope>, ApiError> {
    Ok(Json(state.sources.get_scope(&plugin, id, &scope_id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn delete_scope(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id, scope_id)): ApiPath<(String, ConnectionId, String)>,
    ApiQuery(params): ApiQuery<DeleteScopeParams>,
) -> Result<Json<PurgeReport>, ApiError> {
    let report = state
        .sources
        .delete_scope(&plugin, id, &scope_id, params.delete_data_only)
        .await?;
    Ok(Json(report))
}

// scope configs

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_scope_configs(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
) -> Result<Json<Vec<ScopeConfig>>, ApiError> {
    Ok(Json(state.sources.list_scope_configs(&plugin).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_scope_config(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ScopeConfigId)>,
) -> Result<Json<ScopeConfig>, ApiError> {
    Ok(Json(state.sources.get_scope_config(&plugin, id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create_scope_config(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(plugin): ApiPath<String>,
    ApiJson(input): ApiJson<ScopeConfigInput>,
) -> Result<(StatusCode, Json<ScopeConfig>), ApiError> {
    let cfg = state.sources.save_scope_config(&plugin, None, input).await?;
    Ok((StatusCode::CREATED, Json(cfg)))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn update_scope_config(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ScopeConfigId)>,
    ApiJson(input): ApiJson<ScopeConfigInput>,
) -> Result<Json<ScopeConfig>, ApiError> {
    Ok(Json(state.sources.save_scope_config(&plugin, Some(id), input).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn delete_scope_config(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath((plugin, id)): ApiPath<(String, ScopeConfigId)>,
) -> Result<Json<ScopeConfig>, ApiError> {
    Ok(Json(state.sources.delete_scope_config(&plugin, id).await?))
}

#[cfg(test)]
mod tests {
    use crate::server::router;
    use crate::server::tests::{call, state};
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn connection_and_scope_crud() {
        let (state, _) = state();
        let app = router(state);

        let (status, body) = call(
            &app,
            Method::POST,
            "/plugins/github/connections",
            Some(json!({"name": "gh", "endpoint": "ftp://nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let (_, conn) = call(
            &app,
            Method::POST,
            "/plugins/github/connections",
            Some(json!({"name": "gh", "endpoint": "https://api.github.com/", "token": "secret"})),
        )
        .await;
        assert_eq!(conn["token"], "********");
        let base = format!("/plugins/github/connections/{}", conn["id"]);

        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("{base}/scopes"),
            Some(json!({"data": [{"scopeId": "not-a-repo", "name": "x"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, scopes) = call(
            &app,
            Method::PUT,
            &format!("{base}/scopes"),
            Some(json!({"data": [{"scopeId": "octo/hello", "name": "hello"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scopes[0]["scopeId"], "octo/hello");

        let (status, scope) = call(&app, Method::GET, &format!("{base}/scopes/octo/hello"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scope["name"], "hello");

        // scopes still attached
        let (status, body) = call(&app, Method::DELETE, &base, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "CONFLICT");

        let (status, report) = call(&app, Method::DELETE, &format!("{base}/scopes/octo/hello"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["scopeDeleted"], true);
        let (status, _) = call(&app, Method::DELETE, &base, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, &base, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scope_config_crud() {
        let (state, _) = state();
        let app = router(state);

        let (status, cfg) = call(
            &app,
            Method::POST,
            "/plugins/github/scope-configs",
            Some(json!({"name": "prod", "entities": ["CICD"], "settings": {"productionBranch": "main"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{cfg}");
        let path = format!("/plugins/github/scope-configs/{}", cfg["id"]);

        let (status, updated) = call(
            &app,
            Method::PATCH,
            &path,
            Some(json!({"name": "prod", "entities": ["CICD", "TICKET"], "settings": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["entities"], json!(["CICD", "TICKET"]));

        let (_, list) = call(&app, Method::GET, "/plugins/github/scope-configs", None).await;
        assert_eq!(list.as_array().map(Vec::len), Some(1));
        let (status, _) = call(&app, Method::DELETE, &path, None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
