//! Fixtures shared by unit tests: a no-network plugin, store builders and a
//! local HTTP server helper.

use crate::collector::client::ApiClientPool;
use crate::config::EngineConfig;
use crate::models::{ConnectionId, Status, SyncPolicy};
use crate::pipelines::models::{NewPipeline, NewTask, PipelinePlan, PipelineTask};
use crate::registry::models::{DOMAIN_TYPE_TICKET, SubTaskMeta};
use crate::registry::plugins::{PluginRegistry, decode_options};
use crate::registry::traits::{PlanContext, PlanMaker, Plugin, ScopeSource, TableProducer};
use crate::sources::models::{Connection, Scope};
use crate::storage::memory::MemoryStore;
use crate::storage::traits::{MetaStore, NewRawRecord};
use crate::subtask::{SubTask, SubTaskContext, TaskContext, TaskData};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serve `router` on an ephemeral local port; returns its base url with a trailing slash.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/")
}

/// Fixture options decoded from task options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixtureData {
    pub connection_id: u64,
    pub scope_id: String,
    /// Subtask that returns an error.
    pub fail_at: Option<String>,
    /// Subtask that waits `wait_ms` (or until cancelled).
    pub wait_at: Option<String>,
    pub wait_ms: u64,
}

pub async fn subtask_ctx(options: Value) -> (SubTaskContext, MemoryStore) {
    subtask_ctx_with_policy(options, SyncPolicy::default()).await
}

/// A subtask context backed by a fresh `MemoryStore` holding one pipeline and task.
pub async fn subtask_ctx_with_policy(options: Value, policy: SyncPolicy) -> (SubTaskContext, MemoryStore) {
    let store = MemoryStore::new();
    let (pipeline, tasks) = store
        .create_pipeline(
            &NewPipeline {
                name: "fixture".into(),
                plan: vec![vec![PipelineTask::new("fixture", options.clone())]],
                sync_policy: policy.clone(),
                ..Default::default()
            },
            &[NewTask {
                pipeline_row: 1,
                pipeline_col: 1,
                plugin: "fixture".into(),
                subtasks: vec![],
                options: options.clone(),
                status: Status::Running,
            }],
        )
        .await
        .unwrap();
    let task = TaskContext {
        task_id: tasks[0].id,
        pipeline_id: pipeline.id,
        plugin: "fixture".into(),
        options,
        sync_policy: policy,
        meta: Arc::new(store.clone()),
        records: Arc::new(store.clone()),
        clients: Arc::new(ApiClientPool::new()),
        config: Arc::new(EngineConfig::default()),
        cancel: tokio_util::sync::CancellationToken::new(),
    };
    let data: TaskData = Arc::new(FixtureData::default());
    (SubTaskContext::new(Arc::new(task), data, "collectItems", 1, 1), store)
}

pub const FIXTURE_RAW_TABLE: &str = "_raw_fixture_api_items";
pub const FIXTURE_TOOL_TABLE: &str = "_tool_fixture_items";

/// Records every executed subtask name, in order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

struct Step {
    name: &'static str,
    calls: CallLog,
}

#[async_trait]
impl SubTask for Step {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(self.name.to_string());
        }
        let data = ctx.data::<FixtureData>()?;
        if data.wait_at.as_deref() == Some(self.name) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(data.wait_ms)) => {}
                _ = ctx.cancel_token().cancelled() => {
                    return Err(Error::Cancelled(format!("{} interrupted", self.name)));
                }
            }
        }
        if data.fail_at.as_deref() == Some(self.name) {
            return Err(Error::BackendMessage(format!("{} exploded", self.name)));
        }
        if self.name == "collectItems" {
            let params = json!({"ConnectionId": data.connection_id, "ScopeId": data.scope_id}).to_string();
            ctx.records().ensure_raw_table(FIXTURE_RAW_TABLE).await?;
            ctx.records()
                .insert_raw(
                    FIXTURE_RAW_TABLE,
                    &params,
                    &[NewRawRecord {
                        data: json!({"id": 1}),
                        url: "fixture://items".into(),
                        input: None,
                    }],
                )
                .await?;
        }
        ctx.set_progress(1, Some(1)).await;
        Ok(())
    }
}

/// Plugin named `fixture` whose subtasks touch only the local stores.
#[derive(Default)]
pub struct FixturePlugin {
    pub calls: CallLog,
}

impl FixturePlugin {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn step(&self, name: &'static str) -> Step {
        Step {
            name,
            calls: self.calls.clone(),
        }
    }
}

#[async_trait]
impl Plugin for FixturePlugin {
    fn name(&self) -> &str {
        "fixture"
    }

    fn description(&self) -> &str {
        "no-network plugin used in tests"
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta> {
        vec![
            SubTaskMeta::new("collectItems", self.step("collectItems"))
                .domain_types(&[DOMAIN_TYPE_TICKET])
                .produces(&[FIXTURE_RAW_TABLE]),
            SubTaskMeta::new("extractItems", self.step("extractItems"))
                .required()
                .depends_on(&[FIXTURE_RAW_TABLE])
                .produces(&[FIXTURE_TOOL_TABLE]),
            SubTaskMeta::new("convertItems", self.step("convertItems"))
                .depends_on(&[FIXTURE_TOOL_TABLE])
                .produces(&["issues"]),
            SubTaskMeta::new("enrichItems", self.step("enrichItems")).disabled_by_default(),
        ]
    }

    async fn prepare_task_data(&self, ctx: &TaskContext) -> Result<TaskData> {
        let data: FixtureData = decode_options(&ctx.options)?;
        Ok(Arc::new(data))
    }

    fn scope_source(&self) -> Option<&dyn ScopeSource> {
        Some(self)
    }

    fn table_producer(&self) -> Option<&dyn TableProducer> {
        Some(self)
    }

    fn plan_maker(&self) -> Option<&dyn PlanMaker> {
        Some(self)
    }
}

impl ScopeSource for FixturePlugin {
    fn scope_type(&self) -> &str {
        "FixtureRepo"
    }

    fn scope_params(&self, scope: &Scope) -> Value {
        json!({"ConnectionId": scope.connection_id.0, "ScopeId": scope.scope_id})
    }
}

impl TableProducer for FixturePlugin {
    fn tables(&self) -> Vec<String> {
        vec![FIXTURE_TOOL_TABLE.to_string(), "issues".to_string()]
    }
}

#[async_trait]
impl PlanMaker for FixturePlugin {
    async fn make_plan(&self, ctx: &PlanContext) -> Result<PipelinePlan> {
        let stage = ctx
            .scopes
            .iter()
            .map(|s| {
                PipelineTask::new(
                    "fixture",
                    json!({"connectionId": ctx.connection.id.0, "scopeId": s.scope.scope_id}),
                )
            })
            .collect();
        Ok(vec![stage])
    }
}

/// Registry holding one `FixturePlugin`; the plugin is returned for call inspection.
pub fn fixture_registry() -> (Arc<PluginRegistry>, Arc<FixturePlugin>) {
    let plugin = Arc::new(FixturePlugin::default());
    let mut reg = PluginRegistry::new();
    reg.register(plugin.clone()).unwrap();
    (Arc::new(reg), plugin)
}

pub async fn connection(store: &MemoryStore, plugin: &str) -> Connection {
    let now = Utc::now();
    store
        .create_connection(&Connection {
            id: ConnectionId(0),
            plugin: plugin.into(),
            name: format!("{plugin}-conn"),
            endpoint: "http://localhost/".into(),
            token: None,
            proxy: None,
            rate_limit_per_hour: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap()
}

pub async fn scope(store: &MemoryStore, conn: &Connection, scope_id: &str) -> Scope {
    let now = Utc::now();
    let scope = Scope {
        plugin: conn.plugin.clone(),
        connection_id: conn.id,
        scope_id: scope_id.into(),
        name: scope_id.into(),
        full_name: None,
        scope_config_id: None,
        data: Value::Null,
        created_at: now,
        updated_at: now,
    };
    store.save_scope(&scope).await.unwrap();
    scope
}

/// Orchestrator over `store` running the fixture plugin with default config.
pub fn orchestrator(store: &MemoryStore) -> Arc<crate::pipelines::PipelineOrchestrator> {
    let (registry, _) = fixture_registry();
    let config = Arc::new(EngineConfig::default());
    let runner = Arc::new(crate::runner::TaskRunner::new(
        registry,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(ApiClientPool::new()),
        config.clone(),
    ));
    Arc::new(crate::pipelines::PipelineOrchestrator::new(
        Arc::new(store.clone()),
        runner,
        Arc::new(crate::storage::lock::TableLocks::new()),
        config,
    ))
}
