//! GitHub plugin.
//!
//! Collects issues (incrementally, by `updated_at`) and workflow runs
//! (finalizable: unfinished runs are re-fetched until they complete) for one
//! repository scope, and converts them into the `issues` and
//! `cicd_pipelines` domain tables.

pub mod models;
pub mod tasks;

use crate::github::models::{
    GithubOptions, GithubScopeConfig, RAW_ISSUES_TABLE, RAW_RUNS_TABLE, TOOL_ISSUES_TABLE, TOOL_RUNS_TABLE,
    validate_repo_name,
};
use crate::github::tasks::{
    CollectIssues, CollectRuns, ConvertIssues, ConvertRepo, ConvertRuns, ExtractIssues, ExtractRuns,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tributary_core::collector::{ApiClient, RawDataArgs};
use tributary_core::domain::models::{CICD_PIPELINES_TABLE, ISSUES_TABLE, REPOS_TABLE};
use tributary_core::models::ConnectionId;
use tributary_core::pipelines::models::{PipelinePlan, PipelineTask};
use tributary_core::registry::models::{DOMAIN_TYPE_CICD, DOMAIN_TYPE_CODE, DOMAIN_TYPE_TICKET};
use tributary_core::registry::{
    OpenApiProvider, PlanContext, PlanMaker, Plugin, ScopeSource, SubTaskMeta, TableProducer, decode_options,
};
use tributary_core::sources::{Scope, ScopeInput};
use tributary_core::subtask::{TaskContext, TaskData};
use tributary_core::{Error, Result};

pub const PLUGIN_NAME: &str = "github";

/// Shared by every subtask of one github task.
pub struct GithubTaskData {
    pub options: GithubOptions,
    pub client: Arc<ApiClient>,
}

impl GithubTaskData {
    pub fn raw_args(&self, suffix: &str) -> Result<RawDataArgs> {
        RawDataArgs::new(PLUGIN_NAME, suffix, raw_params(self.options.connection_id, &self.options.name))
    }
}

fn raw_params(connection_id: u64, name: &str) -> Value {
    json!({"ConnectionId": connection_id, "Name": name})
}

#[derive(Debug, Default)]
pub struct GithubPlugin;

impl GithubPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for GithubPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn description(&self) -> &str {
        "Collects issues and workflow runs from GitHub repositories"
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta> {
        vec![
            SubTaskMeta::new("convertRepo", ConvertRepo)
                .description("Write the repository row for the scope")
                .domain_types(&[DOMAIN_TYPE_CODE, DOMAIN_TYPE_TICKET, DOMAIN_TYPE_CICD])
                .produces(&[REPOS_TABLE]),
            SubTaskMeta::new("collectIssues", CollectIssues)
                .description("Collect issues updated since the last successful run")
                .domain_types(&[DOMAIN_TYPE_TICKET])
                .produces(&[RAW_ISSUES_TABLE]),
            SubTaskMeta::new("extractIssues", ExtractIssues)
                .description("Extract raw issues into the tool layer")
                .domain_types(&[DOMAIN_TYPE_TICKET])
                .depends_on(&[RAW_ISSUES_TABLE])
                .produces(&[TOOL_ISSUES_TABLE]),
            SubTaskMeta::new("convertIssues", ConvertIssues)
                .description("Convert tool issues into domain issues")
                .domain_types(&[DOMAIN_TYPE_TICKET])
                .depends_on(&[TOOL_ISSUES_TABLE])
                .produces(&[ISSUES_TABLE]),
            SubTaskMeta::new("collectRuns", CollectRuns)
                .description("Collect new workflow runs and refresh unfinished ones")
                .domain_types(&[DOMAIN_TYPE_CICD])
                .produces(&[RAW_RUNS_TABLE]),
            SubTaskMeta::new("extractRuns", ExtractRuns)
                .description("Extract raw workflow runs into the tool layer")
                .domain_types(&[DOMAIN_TYPE_CICD])
                .depends_on(&[RAW_RUNS_TABLE])
                .produces(&[TOOL_RUNS_TABLE]),
            SubTaskMeta::new("convertRuns", ConvertRuns)
                .description("Convert workflow runs into cicd pipelines")
                .domain_types(&[DOMAIN_TYPE_CICD])
                .depends_on(&[TOOL_RUNS_TABLE])
                .produces(&[CICD_PIPELINES_TABLE]),
        ]
    }

    #[tracing::instrument(level = "debug", skip_all, fields(task_id = %ctx.task_id))]
    async fn prepare_task_data(&self, ctx: &TaskContext) -> Result<TaskData> {
        let options: GithubOptions = decode_options(&ctx.options)?;
        options.validate()?;
        let conn_id = ConnectionId(options.connection_id);
        let conn = ctx
            .meta
            .get_connection(PLUGIN_NAME, conn_id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("github connection {conn_id} does not exist")))?;
        let api = &ctx.config.api;
        let client = ctx.clients.get_or_try_insert(PLUGIN_NAME, conn_id, || {
            ApiClient::for_connection(&conn, api)?
                .header("Accept", "application/vnd.github+json")?
                .header("User-Agent", "tributary")?
                .header("X-GitHub-Api-Version", "2022-11-28")?
                .build()
        })?;
        Ok(Arc::new(GithubTaskData { options, client }))
    }

    fn scope_source(&self) -> Option<&dyn ScopeSource> {
        Some(self)
    }

    fn table_producer(&self) -> Option<&dyn TableProducer> {
        Some(self)
    }

    fn open_api(&self) -> Option<&dyn OpenApiProvider> {
        Some(self)
    }

    fn plan_maker(&self) -> Option<&dyn PlanMaker> {
        Some(self)
    }
}

impl ScopeSource for GithubPlugin {
    fn scope_type(&self) -> &str {
        "GithubRepo"
    }

    /// Scopes are keyed by `owner/repo`.
    fn scope_params(&self, scope: &Scope) -> Value {
        raw_params(scope.connection_id.0, &scope.scope_id)
    }

    fn validate_scope(&self, scope: &ScopeInput) -> Result<()> {
        validate_repo_name(&scope.scope_id)
    }
}

impl TableProducer for GithubPlugin {
    fn tables(&self) -> Vec<String> {
        [TOOL_ISSUES_TABLE, TOOL_RUNS_TABLE, ISSUES_TABLE, CICD_PIPELINES_TABLE, REPOS_TABLE]
            .iter()
            .map(|t| t.to_string())
            .collect()
    }
}

impl OpenApiProvider for GithubPlugin {
    fn open_api_fragment(&self) -> Value {
        json!({
            "components": {
                "schemas": {
                    "GithubScopeConfig": {
                        "type": "object",
                        "properties": {
                            "productionBranch": {"type": "string", "nullable": true}
                        }
                    },
                    "GithubScope": {
                        "type": "object",
                        "required": ["scopeId", "name"],
                        "properties": {
                            "scopeId": {"type": "string", "example": "octo/hello"},
                            "name": {"type": "string"}
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl PlanMaker for GithubPlugin {
    /// One task per repository, all in a single stage. Scope config entities
    /// narrow the subtasks to the matching domain types.
    async fn make_plan(&self, ctx: &PlanContext) -> Result<PipelinePlan> {
        let metas = self.subtask_metas();
        let mut stage = Vec::with_capacity(ctx.scopes.len());
        for s in &ctx.scopes {
            let (settings, entities) = match &s.scope_config {
                Some(cfg) => {
                    let settings: GithubScopeConfig = if cfg.settings.is_null() {
                        GithubScopeConfig::default()
                    } else {
                        decode_options(&cfg.settings)?
                    };
                    (settings, cfg.entities.clone())
                }
                None => (GithubScopeConfig::default(), Vec::new()),
            };
            let options = GithubOptions {
                connection_id: ctx.connection.id.0,
                name: s.scope.scope_id.clone(),
                scope_config: settings,
            };
            let mut task = PipelineTask::new(
                PLUGIN_NAME,
                serde_json::to_value(&options).map_err(|e| Error::backend("encode github options", e))?,
            );
            if !entities.is_empty() {
                task.subtasks = metas
                    .iter()
                    .filter(|m| m.domain_types.iter().any(|d| entities.contains(d)))
                    .map(|m| m.name.clone())
                    .collect();
            }
            stage.push(task);
        }
        Ok(vec![stage])
    }
}
