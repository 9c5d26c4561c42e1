//! In-memory implementation of the storage traits.
//!
//! One mutex guards all state, so every operation (including `purge_scope`)
//! is atomic. Intended for tests and ephemeral runs.

use crate::blueprints::models::{Blueprint, BlueprintQuery};
use crate::collector::stateful::CollectorState;
use crate::domain::lineage::{
    RAW_TABLE_PREFIX, TOOL_TABLE_PREFIX, TableKind, raw_table_prefix, table_kind,
    validate_table_name,
};
use crate::models::{BlueprintId, ConnectionId, PipelineId, ScopeConfigId, Status, TaskId};
use crate::pipelines::models::{
    NewPipeline, NewTask, Pipeline, PipelineQuery, SubTaskRecord, Task, TaskProgress,
    spent_seconds,
};
use crate::sources::models::{Connection, PurgeReport, Scope, ScopeConfig};
use crate::storage::traits::{
    MetaStore, NewRawRecord, RawRecord, Record, RecordFilter, RecordStore, ScopePurge,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct RawTable {
    next_id: u64,
    rows: Vec<RawRecord>,
}

#[derive(Default)]
struct Inner {
    next_pipeline_id: u64,
    next_task_id: u64,
    next_blueprint_id: u64,
    next_connection_id: u64,
    next_scope_config_id: u64,
    pipelines: BTreeMap<PipelineId, Pipeline>,
    tasks: BTreeMap<TaskId, Task>,
    subtask_records: Vec<SubTaskRecord>,
    blueprints: BTreeMap<BlueprintId, Blueprint>,
    connections: BTreeMap<(String, ConnectionId), Connection>,
    scopes: BTreeMap<(String, ConnectionId, String), Scope>,
    scope_configs: BTreeMap<(String, ScopeConfigId), ScopeConfig>,
    collector_states: HashMap<(String, String), CollectorState>,
    raw: BTreeMap<String, RawTable>,
    records: BTreeMap<String, BTreeMap<String, Record>>,
}

fn next(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn page<T: Clone>(items: Vec<T>, offset: u64, limit: u64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn materialize_task(pipeline_id: PipelineId, id: TaskId, t: &NewTask, now: DateTime<Utc>) -> Task {
    Task {
        id,
        pipeline_id,
        pipeline_row: t.pipeline_row,
        pipeline_col: t.pipeline_col,
        plugin: t.plugin.clone(),
        subtasks: t.subtasks.clone(),
        options: t.options.clone(),
        status: t.status,
        message: None,
        error_name: None,
        failed_sub_task: None,
        progress: TaskProgress::default(),
        created_at: now,
        began_at: None,
        finished_at: None,
        spent_seconds: None,
    }
}

// ── MetaStore impl ─────────────────────────────────────────────

#[async_trait]
impl MetaStore for MemoryStore {
    async fn create_pipeline(&self, new: &NewPipeline, tasks: &[NewTask]) -> Result<(Pipeline, Vec<Task>)> {
        let mut g = self.inner.lock().await;
        let now = Utc::now();
        let id = PipelineId(next(&mut g.next_pipeline_id));
        let pipeline = Pipeline {
            id,
            name: new.name.clone(),
            blueprint_id: new.blueprint_id,
            plan: new.plan.clone(),
            status: Status::Created,
            total_tasks: tasks.len() as u64,
            finished_tasks: 0,
            labels: new.labels.clone(),
            sync_policy: new.sync_policy.clone(),
            message: None,
            error_name: None,
            created_at: now,
            updated_at: now,
            began_at: None,
            finished_at: None,
            spent_seconds: None,
        };
        let mut created = Vec::with_capacity(tasks.len());
        for t in tasks {
            let tid = TaskId(next(&mut g.next_task_id));
            let task = materialize_task(id, tid, t, now);
            g.tasks.insert(tid, task.clone());
            created.push(task);
        }
        g.pipelines.insert(id, pipeline.clone());
        Ok((pipeline, created))
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.inner.lock().await.pipelines.get(&id).cloned())
    }

    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<(Vec<Pipeline>, u64)> {
        let g = self.inner.lock().await;
        let mut items: Vec<Pipeline> = g
            .pipelines
            .values()
            .filter(|p| query.statuses.is_empty() || query.statuses.contains(&p.status))
            .filter(|p| query.blueprint_id.is_none() || p.blueprint_id == query.blueprint_id)
            .filter(|p| query.label.as_ref().is_none_or(|l| p.labels.contains(l)))
            .cloned()
            .collect();
        if !query.ascending {
            items.reverse();
        }
        let count = items.len() as u64;
        let p = &query.pagination;
        Ok((page(items, p.offset(), p.limit()), count))
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let mut g = self.inner.lock().await;
        let Some(slot) = g.pipelines.get_mut(&pipeline.id) else {
            return Err(Error::NotFound(format!("pipeline {}", pipeline.id)));
        };
        *slot = pipeline.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn count_pipelines(&self, statuses: &[Status]) -> Result<u64> {
        let g = self.inner.lock().await;
        Ok(g.pipelines
            .values()
            .filter(|p| statuses.contains(&p.status))
            .count() as u64)
    }

    async fn fail_interrupted(&self, message: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let mut n = 0;
        for p in g.pipelines.values_mut().filter(|p| p.status == Status::Running) {
            p.status = Status::Failed;
            p.message = Some(message.to_string());
            p.finished_at = Some(now);
            p.spent_seconds = spent_seconds(p.began_at, now);
            p.updated_at = now;
            n += 1;
        }
        for t in g.tasks.values_mut().filter(|t| t.status == Status::Running) {
            t.status = Status::Failed;
            t.message = Some(message.to_string());
            t.finished_at = Some(now);
            t.spent_seconds = spent_seconds(t.began_at, now);
        }
        Ok(n)
    }

    async fn insert_rerun_tasks(&self, pipeline_id: PipelineId, tasks: &[NewTask]) -> Result<Vec<Task>> {
        let mut g = self.inner.lock().await;
        let now = Utc::now();
        let Some(p) = g.pipelines.get_mut(&pipeline_id) else {
            return Err(Error::NotFound(format!("pipeline {pipeline_id}")));
        };
        p.status = Status::Rerun;
        p.message = None;
        p.error_name = None;
        p.finished_at = None;
        p.updated_at = now;
        let mut created = Vec::with_capacity(tasks.len());
        for t in tasks {
            let tid = TaskId(next(&mut g.next_task_id));
            let task = materialize_task(pipeline_id, tid, t, now);
            g.tasks.insert(tid, task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, pipeline_id: PipelineId) -> Result<Vec<Task>> {
        let g = self.inner.lock().await;
        Ok(g.tasks
            .values()
            .filter(|t| t.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut g = self.inner.lock().await;
        match g.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("task {}", task.id))),
        }
    }

    async fn update_task_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<()> {
        let mut g = self.inner.lock().await;
        match g.tasks.get_mut(&id) {
            Some(slot) => {
                slot.progress = progress.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("task {id}"))),
        }
    }

    async fn insert_subtask_record(&self, record: &SubTaskRecord) -> Result<()> {
        self.inner.lock().await.subtask_records.push(record.clone());
        Ok(())
    }

    async fn list_subtask_records(&self, task_id: TaskId) -> Result<Vec<SubTaskRecord>> {
        let g = self.inner.lock().await;
        Ok(g.subtask_records
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn create_blueprint(&self, blueprint: &Blueprint) -> Result<Blueprint> {
        let mut g = self.inner.lock().await;
        if let Some(project) = &blueprint.project_name {
            if g.blueprints
                .values()
                .any(|b| b.project_name.as_ref() == Some(project))
            {
                return Err(Error::Conflict(format!(
                    "project {project} already has a blueprint"
                )));
            }
        }
        let mut bp = blueprint.clone();
        bp.id = BlueprintId(next(&mut g.next_blueprint_id));
        g.blueprints.insert(bp.id, bp.clone());
        Ok(bp)
    }

    async fn update_blueprint(&self, blueprint: &Blueprint) -> Result<()> {
        let mut g = self.inner.lock().await;
        if let Some(project) = &blueprint.project_name {
            if g.blueprints
                .values()
                .any(|b| b.id != blueprint.id && b.project_name.as_ref() == Some(project))
            {
                return Err(Error::Conflict(format!(
                    "project {project} already has a blueprint"
                )));
            }
        }
        match g.blueprints.get_mut(&blueprint.id) {
            Some(slot) => {
                *slot = blueprint.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("blueprint {}", blueprint.id))),
        }
    }

    async fn get_blueprint(&self, id: BlueprintId) -> Result<Option<Blueprint>> {
        Ok(self.inner.lock().await.blueprints.get(&id).cloned())
    }

    async fn get_blueprint_by_project(&self, project_name: &str) -> Result<Option<Blueprint>> {
        let g = self.inner.lock().await;
        Ok(g.blueprints
            .values()
            .find(|b| b.project_name.as_deref() == Some(project_name))
            .cloned())
    }

    async fn list_blueprints(&self, query: &BlueprintQuery) -> Result<(Vec<Blueprint>, u64)> {
        let g = self.inner.lock().await;
        let items: Vec<Blueprint> = g
            .blueprints
            .values()
            .filter(|b| query.enable.is_none_or(|e| b.enable == e))
            .filter(|b| query.is_manual.is_none_or(|m| b.is_manual == m))
            .filter(|b| query.mode.is_none_or(|m| b.mode == m))
            .filter(|b| query.label.as_ref().is_none_or(|l| b.labels.contains(l)))
            .cloned()
            .collect();
        let count = items.len() as u64;
        let p = &query.pagination;
        Ok((page(items, p.offset(), p.limit()), count))
    }

    async fn delete_blueprint(&self, id: BlueprintId) -> Result<bool> {
        Ok(self.inner.lock().await.blueprints.remove(&id).is_some())
    }

    async fn create_connection(&self, connection: &Connection) -> Result<Connection> {
        let mut g = self.inner.lock().await;
        let mut c = connection.clone();
        c.id = ConnectionId(next(&mut g.next_connection_id));
        g.connections.insert((c.plugin.clone(), c.id), c.clone());
        Ok(c)
    }

    async fn update_connection(&self, connection: &Connection) -> Result<()> {
        let mut g = self.inner.lock().await;
        match g
            .connections
            .get_mut(&(connection.plugin.clone(), connection.id))
        {
            Some(slot) => {
                *slot = connection.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("connection {}", connection.id))),
        }
    }

    async fn get_connection(&self, plugin: &str, id: ConnectionId) -> Result<Option<Connection>> {
        let g = self.inner.lock().await;
        Ok(g.connections.get(&(plugin.to_string(), id)).cloned())
    }

    async fn list_connections(&self, plugin: &str) -> Result<Vec<Connection>> {
        let g = self.inner.lock().await;
        Ok(g.connections
            .values()
            .filter(|c| c.plugin == plugin)
            .cloned()
            .collect())
    }

    async fn delete_connection(&self, plugin: &str, id: ConnectionId) -> Result<bool> {
        let mut g = self.inner.lock().await;
        Ok(g.connections.remove(&(plugin.to_string(), id)).is_some())
    }

    async fn save_scope(&self, scope: &Scope) -> Result<()> {
        let mut g = self.inner.lock().await;
        let key = (
            scope.plugin.clone(),
            scope.connection_id,
            scope.scope_id.clone(),
        );
        let mut s = scope.clone();
        if let Some(existing) = g.scopes.get(&key) {
            s.created_at = existing.created_at;
        }
        g.scopes.insert(key, s);
        Ok(())
    }

    async fn get_scope(&self, plugin: &str, connection_id: ConnectionId, scope_id: &str) -> Result<Option<Scope>> {
        let g = self.inner.lock().await;
        Ok(g.scopes
            .get(&(plugin.to_string(), connection_id, scope_id.to_string()))
            .cloned())
    }

    async fn list_scopes(&self, plugin: &str, connection_id: ConnectionId) -> Result<Vec<Scope>> {
        let g = self.inner.lock().await;
        Ok(g.scopes
            .values()
            .filter(|s| s.plugin == plugin && s.connection_id == connection_id)
            .cloned()
            .collect())
    }

    async fn count_scopes(&self, plugin: &str, connection_id: ConnectionId) -> Result<u64> {
        Ok(self.list_scopes(plugin, connection_id).await?.len() as u64)
    }

    async fn count_scopes_with_config(&self, plugin: &str, scope_config_id: ScopeConfigId) -> Result<u64> {
        let g = self.inner.lock().await;
        Ok(g.scopes
            .values()
            .filter(|s| s.plugin == plugin && s.scope_config_id == Some(scope_config_id))
            .count() as u64)
    }

    async fn create_scope_config(&self, config: &ScopeConfig) -> Result<ScopeConfig> {
        let mut g = self.inner.lock().await;
        let mut c = config.clone();
        c.id = ScopeConfigId(next(&mut g.next_scope_config_id));
        g.scope_configs.insert((c.plugin.clone(), c.id), c.clone());
        Ok(c)
    }

    async fn update_scope_config(&self, config: &ScopeConfig) -> Result<()> {
        let mut g = self.inner.lock().await;
        match g.scope_configs.get_mut(&(config.plugin.clone(), config.id)) {
            Some(slot) => {
                *slot = config.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("scope config {}", config.id))),
        }
    }

    async fn get_scope_config(&self, plugin: &str, id: ScopeConfigId) -> Result<Option<ScopeConfig>> {
        let g = self.inner.lock().await;
        Ok(g.scope_configs.get(&(plugin.to_string(), id)).cloned())
    }

    async fn list_scope_configs(&self, plugin: &str) -> Result<Vec<ScopeConfig>> {
        let g = self.inner.lock().await;
        Ok(g.scope_configs
            .values()
            .filter(|c| c.plugin == plugin)
            .cloned()
            .collect())
    }

    async fn delete_scope_config(&self, plugin: &str, id: ScopeConfigId) -> Result<bool> {
        let mut g = self.inner.lock().await;
        Ok(g.scope_configs.remove(&(plugin.to_string(), id)).is_some())
    }

    async fn get_collector_state(&self, raw_table: &str, raw_params: &str) -> Result<Option<CollectorState>> {
        let g = self.inner.lock().await;
        Ok(g.collector_states
            .get(&(raw_table.to_string(), raw_params.to_string()))
            .cloned())
    }

    async fn save_collector_state(&self, state: &CollectorState) -> Result<()> {
        let mut g = self.inner.lock().await;
        g.collector_states.insert(
            (state.raw_data_table.clone(), state.raw_data_params.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn purge_scope(&self, purge: &ScopePurge) -> Result<PurgeReport> {
        let mut g = self.inner.lock().await;
        let prefix = raw_table_prefix(&purge.plugin);
        let params = purge.raw_data_params.as_str();
        let mut report = PurgeReport::default();

        for (name, table) in g.raw.iter_mut() {
            if !name.starts_with(&prefix) {
                continue;
            }
            let before = table.rows.len();
            table.rows.retain(|r| r.params != params);
            report.raw_rows += (before - table.rows.len()) as u64;
        }
        for (name, rows) in g.records.iter_mut() {
            let before = rows.len();
            rows.retain(|_, r| {
                !(r.origin.raw_data_table.starts_with(&prefix)
                    && r.origin.raw_data_params == params)
            });
            let removed = (before - rows.len()) as u64;
            match table_kind(name) {
                TableKind::Tool => report.tool_rows += removed,
                _ => report.domain_rows += removed,
            }
        }
        let before = g.collector_states.len();
        g.collector_states
            .retain(|(t, p), _| !(t.starts_with(&prefix) && p == params));
        report.collector_states = (before - g.collector_states.len()) as u64;

        if let Some((connection_id, scope_id)) = &purge.scope {
            report.scope_deleted = g
                .scopes
                .remove(&(purge.plugin.clone(), *connection_id, scope_id.clone()))
                .is_some();
        }
        Ok(report)
    }
}

// ── RecordStore impl ───────────────────────────────────────────

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ensure_raw_table(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        if !table.starts_with(RAW_TABLE_PREFIX) {
            return Err(Error::InvalidInput(format!(
                "raw table must start with {RAW_TABLE_PREFIX}: {table}"
            )));
        }
        self.inner
            .lock()
            .await
            .raw
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn insert_raw(&self, table: &str, params: &str, rows: &[NewRawRecord]) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let Some(t) = g.raw.get_mut(table) else {
            return Err(Error::NotFound(format!("raw table {table}")));
        };
        let now = Utc::now();
        let mut inserted = 0;
        for row in rows {
            let fp = row.fingerprint();
            if t.rows.iter().any(|r| r.params == params && r.fingerprint == fp) {
                continue;
            }
            let id = next(&mut t.next_id);
            t.rows.push(RawRecord {
                id,
                params: params.to_string(),
                data: row.data.clone(),
                url: row.url.clone(),
                input: row.input.clone(),
                fingerprint: fp,
                created_at: now,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn delete_raw(&self, table: &str, params: &str) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let Some(t) = g.raw.get_mut(table) else {
            return Ok(0);
        };
        let before = t.rows.len();
        t.rows.retain(|r| r.params != params);
        Ok((before - t.rows.len()) as u64)
    }

    async fn fetch_raw(&self, table: &str, params: &str, after_id: u64, limit: usize) -> Result<Vec<RawRecord>> {
        let g = self.inner.lock().await;
        let Some(t) = g.raw.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.rows
            .iter()
            .filter(|r| r.params == params && r.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_raw(&self, table: &str, params: &str) -> Result<u64> {
        let g = self.inner.lock().await;
        Ok(g.raw
            .get(table)
            .map(|t| t.rows.iter().filter(|r| r.params == params).count() as u64)
            .unwrap_or(0))
    }

    async fn ensure_record_table(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        if matches!(table_kind(table), TableKind::Raw | TableKind::Meta) {
            return Err(Error::InvalidInput(format!(
                "record table must be a {TOOL_TABLE_PREFIX} or domain table: {table}"
            )));
        }
        self.inner
            .lock()
            .await
            .records
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert_records(&self, table: &str, records: &[Record]) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let Some(t) = g.records.get_mut(table) else {
            return Err(Error::NotFound(format!("record table {table}")));
        };
        for r in records {
            t.insert(r.key.clone(), r.clone());
        }
        Ok(records.len() as u64)
    }

    async fn get_record(&self, table: &str, key: &str) -> Result<Option<Record>> {
        let g = self.inner.lock().await;
        Ok(g.records.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn fetch_records(
        &self,
        table: &str,
        filter: &RecordFilter,
        after_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let g = self.inner.lock().await;
        let Some(t) = g.records.get(table) else {
            return Ok(Vec::new());
        };
        Ok(t.values()
            .filter(|r| after_key.is_none_or(|k| r.key.as_str() > k))
            .filter(|r| filter.matches(&r.origin))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_records(&self, table: &str, filter: &RecordFilter) -> Result<u64> {
        let g = self.inner.lock().await;
        Ok(g.records
            .get(table)
            .map(|t| t.values().filter(|r| filter.matches(&r.origin)).count() as u64)
            .unwrap_or(0))
    }

    async fn delete_records(&self, table: &str, filter: &RecordFilter) -> Result<u64> {
        let mut g = self.inner.lock().await;
        let Some(t) = g.records.get_mut(table) else {
            return Ok(0);
        };
        let before = t.len();
        t.retain(|_, r| !filter.matches(&r.origin));
        Ok((before - t.len()) as u64)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let g = self.inner.lock().await;
        let mut out: Vec<String> = g.raw.keys().chain(g.records.keys()).cloned().collect();
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lineage::RawDataOrigin;
    use serde_json::json;

    #[tokio::test]
    async fn raw_insert_dedupes_by_fingerprint() {
        let s = MemoryStore::new();
        s.ensure_raw_table("_raw_github_api_issues").await.unwrap();
        let rows = vec![
            NewRawRecord {
                data: json!({"id": 1}),
                url: "u".into(),
                input: None,
            },
            NewRawRecord {
                data: json!({"id": 2}),
                url: "u".into(),
                input: None,
            },
        ];
        assert_eq!(s.insert_raw("_raw_github_api_issues", "p", &rows).await.unwrap(), 2);
        assert_eq!(s.insert_raw("_raw_github_api_issues", "p", &rows).await.unwrap(), 0);
        assert_eq!(s.insert_raw("_raw_github_api_issues", "q", &rows).await.unwrap(), 2);
        assert_eq!(s.count_raw("_raw_github_api_issues", "p").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn purge_only_touches_matching_params() {
        let s = MemoryStore::new();
        s.ensure_raw_table("_raw_github_api_issues").await.unwrap();
        s.ensure_record_table("issues").await.unwrap();
        let row = NewRawRecord {
            data: json!({"id": 1}),
            url: "u".into(),
            input: None,
        };
        s.insert_raw("_raw_github_api_issues", "a", std::slice::from_ref(&row))
            .await
            .unwrap();
        s.insert_raw("_raw_github_api_issues", "b", &[row]).await.unwrap();
        let rec = |key: &str, params: &str| Record {
            key: key.into(),
            data: json!({}),
            origin: RawDataOrigin::new("_raw_github_api_issues", params, 1),
        };
        s.upsert_records("issues", &[rec("1", "a"), rec("2", "b")])
            .await
            .unwrap();

        let report = s
            .purge_scope(&ScopePurge {
                plugin: "github".into(),
                raw_data_params: "a".into(),
                scope: None,
            })
            .await
            .unwrap();
        assert_eq!(report.raw_rows, 1);
        assert_eq!(report.domain_rows, 1);
        assert_eq!(s.count_raw("_raw_github_api_issues", "b").await.unwrap(), 1);
        assert!(s.get_record("issues", "2").await.unwrap().is_some());
    }
}
