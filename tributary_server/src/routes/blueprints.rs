use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tributary_core::blueprints::{Blueprint, BlueprintList, BlueprintMode, BlueprintPatch, BlueprintQuery, NewBlueprint};
use tributary_core::{BlueprintId, Pagination, Pipeline};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListBlueprintsParams {
    pub enable: Option<bool>,
    pub is_manual: Option<bool>,
    pub mode: Option<BlueprintMode>,
    pub label: Option<String>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

impl From<ListBlueprintsParams> for BlueprintQuery {
    fn from(p: ListBlueprintsParams) -> Self {
        BlueprintQuery {
            enable: p.enable,
            is_manual: p.is_manual,
            mode: p.mode,
            label: p.label,
            pagination: Pagination::new(p.page, p.page_size),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/blueprints", post(create).get(list))
        .route("/blueprints/{id}", get(get_blueprint).patch(update).delete(delete))
        .route("/blueprints/{id}/trigger", post(trigger))
        .route("/projects/{name}/blueprint", get(get_by_project))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    ApiJson(new): ApiJson<NewBlueprint>,
) -> Result<(StatusCode, Json<Blueprint>), ApiError> {
    let bp = state.blueprints.create(new).await?;
    Ok((StatusCode::CREATED, Json(bp)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    ApiQuery(params): ApiQuery<ListBlueprintsParams>,
) -> Result<Json<BlueprintList>, ApiError> {
    Ok(Json(state.blueprints.list(&params.into()).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_blueprint(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<BlueprintId>,
) -> Result<Json<Blueprint>, ApiError> {
    Ok(Json(state.blueprints.get(id).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_by_project(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(name): ApiPath<String>,
) -> Result<Json<Blueprint>, ApiError> {
    Ok(Json(state.blueprints.get_by_project(&name).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn update(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<BlueprintId>,
    ApiJson(body): ApiJson<Value>,
) -> Result<Json<Blueprint>, ApiError> {
    let patch = BlueprintPatch::from_json(body)?;
    Ok(Json(state.blueprints.update(id, patch).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn delete(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<BlueprintId>,
) -> Result<Json<Value>, ApiError> {
    state.blueprints.delete(id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn trigger(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<BlueprintId>,
) -> Result<(StatusCode, Json<Pipeline>), ApiError> {
    let pipeline = state.blueprints.trigger(id).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

#[cfg(test)]
mod tests {
    use crate::server::router;
    use crate::server::tests::{call, state};
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn normal_blueprint_lifecycle() {
        let (state, _) = state();
        let app = router(state);

        let (status, conn) = call(
            &app,
            Method::POST,
            "/plugins/github/connections",
            Some(json!({"name": "gh", "endpoint": "https://api.github.com/", "token": "secret"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let conn_id = conn["id"].as_u64().unwrap();
        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/plugins/github/connections/{conn_id}/scopes"),
            Some(json!({"data": [{"scopeId": "octo/hello", "name": "hello"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, bp) = call(
            &app,
            Method::POST,
            "/blueprints",
            Some(json!({
                "name": "nightly",
                "projectName": "octo",
                "cronConfig": "0 0 * * *",
                "connections": [{"pluginName": "github", "connectionId": conn_id, "scopes": [{"scopeId": "octo/hello"}]}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{bp}");
        assert_eq!(bp["isManual"], false);
        assert!(bp["nextRunAt"].is_string());
        let id = bp["id"].as_u64().unwrap();

        let (_, by_project) = call(&app, Method::GET, "/projects/octo/blueprint", None).await;
        assert_eq!(by_project["id"], id);

        let (status, body) = call(&app, Method::PATCH, &format!("/blueprints/{id}"), Some(json!({"mode": "ADVANCED"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "BAD_INPUT");

        let (status, pipeline) = call(&app, Method::POST, &format!("/blueprints/{id}/trigger"), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(pipeline["blueprintId"], id);
        assert_eq!(pipeline["totalTasks"], 1);
        // one pending pipeline per blueprint
        let (status, _) = call(&app, Method::POST, &format!("/blueprints/{id}/trigger"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // the scope is still collected, so deleting it is refused with refs
        let (status, body) = call(
            &app,
            Method::DELETE,
            &format!("/plugins/github/connections/{conn_id}/scopes/octo/hello"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["refs"]["blueprints"], json!(["nightly"]));

        let (status, list) = call(&app, Method::GET, "/blueprints?isManual=false&mode=NORMAL", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["count"], 1);

        let (status, _) = call(&app, Method::DELETE, &format!("/blueprints/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, &format!("/blueprints/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
