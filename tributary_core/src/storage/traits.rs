use crate::blueprints::models::{Blueprint, BlueprintQuery};
use crate::collector::stateful::CollectorState;
use crate::domain::lineage::RawDataOrigin;
use crate::models::{BlueprintId, ConnectionId, PipelineId, ScopeConfigId, Status, TaskId};
use crate::pipelines::models::{
    NewPipeline, NewTask, Pipeline, PipelineQuery, SubTaskRecord, Task, TaskProgress,
};
use crate::sources::models::{Connection, PurgeReport, Scope, ScopeConfig};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name used when locking the pipelines table.
pub const PIPELINES_TABLE: &str = "_tributary_pipelines";
/// Name used when locking the tasks table.
pub const TASKS_TABLE: &str = "_tributary_tasks";
/// Name used when locking scopes against their connection and scope config.
pub const SCOPES_TABLE: &str = "_tributary_scopes";

/// Engine metadata: pipelines, tasks, blueprints, connections, scopes,
/// scope configs and collector state.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Persist a pipeline and all of its task rows atomically.
    async fn create_pipeline(&self, new: &NewPipeline, tasks: &[NewTask]) -> Result<(Pipeline, Vec<Task>)>;
    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;
    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<(Vec<Pipeline>, u64)>;
    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()>;
    async fn count_pipelines(&self, statuses: &[Status]) -> Result<u64>;
    /// Mark every RUNNING pipeline and task FAILED. Returns affected pipelines.
    async fn fail_interrupted(&self, message: &str, now: DateTime<Utc>) -> Result<u64>;

    /// Insert rerun task rows and flip the pipeline to RERUN in one transaction.
    async fn insert_rerun_tasks(&self, pipeline_id: PipelineId, tasks: &[NewTask]) -> Result<Vec<Task>>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;
    /// All task rows of a pipeline, oldest first.
    async fn list_tasks(&self, pipeline_id: PipelineId) -> Result<Vec<Task>>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn update_task_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<()>;
    async fn insert_subtask_record(&self, record: &SubTaskRecord) -> Result<()>;
    async fn list_subtask_records(&self, task_id: TaskId) -> Result<Vec<SubTaskRecord>>;

    /// Insert a blueprint; the id on the input is ignored.
    async fn create_blueprint(&self, blueprint: &Blueprint) -> Result<Blueprint>;
    async fn update_blueprint(&self, blueprint: &Blueprint) -> Result<()>;
    async fn get_blueprint(&self, id: BlueprintId) -> Result<Option<Blueprint>>;
    async fn get_blueprint_by_project(&self, project_name: &str) -> Result<Option<Blueprint>>;
    async fn list_blueprints(&self, query: &BlueprintQuery) -> Result<(Vec<Blueprint>, u64)>;
    async fn delete_blueprint(&self, id: BlueprintId) -> Result<bool>;

    /// Insert a connection; the id on the input is ignored.
    async fn create_connection(&self, connection: &Connection) -> Result<Connection>;
    async fn update_connection(&self, connection: &Connection) -> Result<()>;
    async fn get_connection(&self, plugin: &str, id: ConnectionId) -> Result<Option<Connection>>;
    async fn list_connections(&self, plugin: &str) -> Result<Vec<Connection>>;
    async fn delete_connection(&self, plugin: &str, id: ConnectionId) -> Result<bool>;

    /// Upsert keyed by (plugin, connection, scope id).
    async fn save_scope(&self, scope: &Scope) -> Result<()>;
    async fn get_scope(&self, plugin: &str, connection_id: ConnectionId, scope_id: &str) -> Result<Option<Scope>>;
    async fn list_scopes(&self, plugin: &str, connection_id: ConnectionId) -> Result<Vec<Scope>>;
    async fn count_scopes(&self, plugin: &str, connection_id: ConnectionId) -> Result<u64>;
    async fn count_scopes_with_config(&self, plugin: &str, scope_config_id: ScopeConfigId) -> Result<u64>;

    async fn create_scope_config(&self, config: &ScopeConfig) -> Result<ScopeConfig>;
    async fn update_scope_config(&self, config: &ScopeConfig) -> Result<()>;
    async fn get_scope_config(&self, plugin: &str, id: ScopeConfigId) -> Result<Option<ScopeConfig>>;
    async fn list_scope_configs(&self, plugin: &str) -> Result<Vec<ScopeConfig>>;
    async fn delete_scope_config(&self, plugin: &str, id: ScopeConfigId) -> Result<bool>;

    async fn get_collector_state(&self, raw_table: &str, raw_params: &str) -> Result<Option<CollectorState>>;
    async fn save_collector_state(&self, state: &CollectorState) -> Result<()>;

    /// Delete every row a scope produced, and optionally the scope row, in one transaction.
    async fn purge_scope(&self, purge: &ScopePurge) -> Result<PurgeReport>;
}

/// Target of a scope data purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePurge {
    pub plugin: String,
    /// Canonical scope params.
    pub raw_data_params: String,
    /// Scope row to delete as well; `None` keeps it (data-only purge).
    pub scope: Option<(ConnectionId, String)>,
}

/// One staged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: u64,
    pub params: String,
    pub data: Value,
    pub url: String,
    pub input: Option<Value>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Payload to stage; params are supplied per batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRawRecord {
    pub data: Value,
    pub url: String,
    pub input: Option<Value>,
}

impl NewRawRecord {
    /// SHA-256 over the payload and input, used to dedupe re-collection.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut h = Sha256::new();
        h.update(crate::domain::lineage::canonical_params(&self.data).as_bytes());
        if let Some(input) = &self.input {
            h.update(b"\x00");
            h.update(crate::domain::lineage::canonical_params(input).as_bytes());
        }
        hex::encode(h.finalize())
    }
}

/// A tool-layer or domain-layer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub data: Value,
    #[serde(flatten)]
    pub origin: RawDataOrigin,
}

/// Lineage filter for record queries and deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub raw_data_table: Option<String>,
    pub raw_data_params: Option<String>,
}

impl RecordFilter {
    pub fn by_origin(raw_table: impl Into<String>, raw_params: impl Into<String>) -> Self {
        Self {
            raw_data_table: Some(raw_table.into()),
            raw_data_params: Some(raw_params.into()),
        }
    }

    pub fn matches(&self, origin: &RawDataOrigin) -> bool {
        self.raw_data_table
            .as_deref()
            .is_none_or(|t| t == origin.raw_data_table)
            && self
                .raw_data_params
                .as_deref()
                .is_none_or(|p| p == origin.raw_data_params)
    }
}

/// Raw staging tables and the dynamic tool/domain tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ensure_raw_table(&self, table: &str) -> Result<()>;
    /// Insert payloads; duplicates (same params + fingerprint) are ignored. Returns inserted count.
    async fn insert_raw(&self, table: &str, params: &str, rows: &[NewRawRecord]) -> Result<u64>;
    async fn delete_raw(&self, table: &str, params: &str) -> Result<u64>;
    /// Rows with id > `after_id`, ascending.
    async fn fetch_raw(&self, table: &str, params: &str, after_id: u64, limit: usize) -> Result<Vec<RawRecord>>;
    async fn count_raw(&self, table: &str, params: &str) -> Result<u64>;

    async fn ensure_record_table(&self, table: &str) -> Result<()>;
    /// Idempotent upsert keyed by `Record::key`. Returns written count.
    async fn upsert_records(&self, table: &str, records: &[Record]) -> Result<u64>;
    async fn get_record(&self, table: &str, key: &str) -> Result<Option<Record>>;
    /// Rows with key > `after_key`, ascending by key.
    async fn fetch_records(
        &self,
        table: &str,
        filter: &RecordFilter,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>>;
    async fn count_records(&self, table: &str, filter: &RecordFilter) -> Result<u64>;
    async fn delete_records(&self, table: &str, filter: &RecordFilter) -> Result<u64>;

    /// All raw and record tables created so far.
    async fn list_tables(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = NewRawRecord {
            data: json!({"id": 1, "title": "x"}),
            url: "a".into(),
            input: None,
        };
        let b = NewRawRecord {
            data: json!({"title": "x", "id": 1}),
            url: "b".into(),
            input: None,
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = NewRawRecord {
            input: Some(json!({"id": 9})),
            ..a.clone()
        };
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn filter_matches_origin() {
        let o = RawDataOrigin::new("_raw_github_api_issues", "{\"a\":1}", 3);
        assert!(RecordFilter::default().matches(&o));
        assert!(RecordFilter::by_origin("_raw_github_api_issues", "{\"a\":1}").matches(&o));
        assert!(!RecordFilter::by_origin("_raw_github_api_issues", "{\"a\":2}").matches(&o));
    }
}
