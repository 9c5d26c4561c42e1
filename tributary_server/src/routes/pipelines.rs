use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tributary_core::pipelines::{NewPipeline, Pipeline, PipelineList, PipelineQuery, Task};
use tributary_core::{BlueprintId, Pagination, PipelineId, Status};

/// `?status=FAILED,PARTIAL&blueprintId=3&label=x&page=1&pageSize=20`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListPipelinesParams {
    pub status: Option<String>,
    pub blueprint_id: Option<BlueprintId>,
    pub label: Option<String>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

impl ListPipelinesParams {
    fn into_query(self) -> Result<PipelineQuery, ApiError> {
        let statuses = match self.status.as_deref() {
            Some(s) if !s.trim().is_empty() => s
                .split(',')
                .map(|v| v.parse::<Status>().map_err(|e| ApiError::InvalidInput(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        Ok(PipelineQuery {
            statuses,
            blueprint_id: self.blueprint_id,
            label: self.label,
            ascending: false,
            pagination: Pagination::new(self.page, self.page_size),
        })
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/pipelines", post(create).get(list))
        .route("/pipelines/{id}", get(get_pipeline).delete(cancel))
        .route("/pipelines/{id}/tasks", get(tasks))
        .route("/pipelines/{id}/rerun", post(rerun))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    ApiJson(new): ApiJson<NewPipeline>,
) -> Result<(StatusCode, Json<Pipeline>), ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::InvalidInput("pipeline name is empty".to_string()));
    }
    let pipeline = state.orchestrator.submit(new).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    ApiQuery(params): ApiQuery<ListPipelinesParams>,
) -> Result<Json<PipelineList>, ApiError> {
    let query = params.into_query()?;
    Ok(Json(state.orchestrator.list(&query).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_pipeline(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<PipelineId>,
) -> Result<Json<Pipeline>, ApiError> {
    Ok(Json(state.orchestrator.get(id).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn tasks(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<PipelineId>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.orchestrator.tasks(id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn cancel(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<PipelineId>,
) -> Result<Json<Pipeline>, ApiError> {
    Ok(Json(state.orchestrator.cancel(id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn rerun(
    Extension(state): Extension<Arc<AppState>>,
    ApiPath(id): ApiPath<PipelineId>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.orchestrator.rerun(id).await?))
}
