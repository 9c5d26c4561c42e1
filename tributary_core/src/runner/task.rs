use crate::collector::client::ApiClientPool;
use crate::config::EngineConfig;
use crate::models::{Status, SyncPolicy, TaskId};
use crate::pipelines::models::{SubTaskRecord, Task, TaskProgress, spent_seconds};
use crate::registry::models::SubTaskMeta;
use crate::registry::plugins::PluginRegistry;
use crate::storage::traits::{MetaStore, RecordStore};
use crate::subtask::{SubTaskContext, TaskContext};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Why a task stopped before finishing its subtasks.
#[derive(Debug)]
pub struct TaskFailure {
    /// `None` when the task failed before any subtask started.
    pub subtask: Option<String>,
    pub error: Error,
}

impl From<Error> for TaskFailure {
    fn from(error: Error) -> Self {
        Self { subtask: None, error }
    }
}

/// Pick the subtasks a task runs, in declared order.
///
/// Defaults come from `enabled_by_default`. Naming subtasks replaces the
/// defaults. Required subtasks always run, and `skip_collectors` drops
/// every `collect*` subtask.
pub fn select_subtasks(metas: &[SubTaskMeta], names: &[String], policy: &SyncPolicy) -> Result<Vec<SubTaskMeta>> {
    let mut flags: BTreeMap<&str, bool> = metas
        .iter()
        .map(|m| (m.name.as_str(), m.enabled_by_default))
        .collect();
    if !names.is_empty() {
        flags.values_mut().for_each(|v| *v = false);
        for n in names {
            match flags.get_mut(n.as_str()) {
                Some(v) => *v = true,
                None => return Err(Error::InvalidInput(format!("subtask {n} does not exist"))),
            }
        }
    }
    Ok(metas
        .iter()
        .filter(|m| m.required || flags.get(m.name.as_str()).copied().unwrap_or(false))
        .filter(|m| !(policy.skip_collectors && m.name.starts_with("collect")))
        .cloned()
        .collect())
}

/// Executes task rows: one plugin invocation each, subtasks strictly in order.
pub struct TaskRunner {
    registry: Arc<PluginRegistry>,
    meta: Arc<dyn MetaStore>,
    records: Arc<dyn RecordStore>,
    clients: Arc<ApiClientPool>,
    config: Arc<EngineConfig>,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<PluginRegistry>,
        meta: Arc<dyn MetaStore>,
        records: Arc<dyn RecordStore>,
        clients: Arc<ApiClientPool>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            meta,
            records,
            clients,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Run one task to a terminal state and persist the outcome.
    ///
    /// Storage errors are returned; subtask errors are recorded on the task.
    #[tracing::instrument(level = "info", skip(self, policy, cancel))]
    pub async fn run_task(&self, task_id: TaskId, policy: &SyncPolicy, cancel: CancellationToken) -> Result<Task> {
        let mut task = self
            .meta
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if task.status.is_terminal() {
            return Ok(task);
        }

        let began = Utc::now();
        if cancel.is_cancelled() {
            task.status = Status::Cancelled;
            task.message = Some("cancelled before start".to_string());
            task.finished_at = Some(began);
            self.meta.update_task(&task).await?;
            return Ok(task);
        }

        task.status = Status::Running;
        task.began_at = Some(began);
        task.message = None;
        self.meta.update_task(&task).await?;

        let outcome = self.run_plugin_subtasks(&task, policy, cancel).await;

        // progress may have been written meanwhile
        if let Some(fresh) = self.meta.get_task(task_id).await? {
            task.progress = fresh.progress;
        }
        let finished = Utc::now();
        task.finished_at = Some(finished);
        task.spent_seconds = spent_seconds(task.began_at, finished);
        match outcome {
            Ok(()) => {
                task.status = Status::Completed;
                tracing::info!(task_id = %task.id, plugin = %task.plugin, "task completed");
            }
            Err(f) => {
                task.status = if f.error.is_cancelled() {
                    Status::Cancelled
                } else {
                    Status::Failed
                };
                task.message = Some(f.error.to_string());
                task.error_name = Some(format!("{:?}", f.error.kind()));
                task.failed_sub_task = f.subtask;
                tracing::warn!(
                    error = %f.error,
                    task_id = %task.id,
                    plugin = %task.plugin,
                    status = %task.status,
                    "task did not complete"
                );
            }
        }
        self.meta.update_task(&task).await?;
        Ok(task)
    }

    /// Prepare the plugin's task data and run the selected subtasks in order.
    #[tracing::instrument(level = "debug", skip_all, fields(task_id = %task.id, plugin = %task.plugin))]
    pub async fn run_plugin_subtasks(
        &self,
        task: &Task,
        policy: &SyncPolicy,
        cancel: CancellationToken,
    ) -> std::result::Result<(), TaskFailure> {
        let plugin = self.registry.get(&task.plugin)?;
        let selected = select_subtasks(&plugin.subtask_metas(), &task.subtasks, policy)?;

        let task_ctx = Arc::new(TaskContext {
            task_id: task.id,
            pipeline_id: task.pipeline_id,
            plugin: task.plugin.clone(),
            options: task.options.clone(),
            sync_policy: policy.clone(),
            meta: self.meta.clone(),
            records: self.records.clone(),
            clients: self.clients.clone(),
            config: self.config.clone(),
            cancel,
        });
        let data = plugin.prepare_task_data(&task_ctx).await?;

        let total = selected.len() as u32;
        let mut result = Ok(());
        for (i, meta) in selected.iter().enumerate() {
            let number = i as u32 + 1;
            if task_ctx.is_cancelled() {
                result = Err(TaskFailure {
                    subtask: Some(meta.name.clone()),
                    error: Error::Cancelled(format!("task {} cancelled", task.id)),
                });
                break;
            }
            let ctx = SubTaskContext::new(task_ctx.clone(), data.clone(), meta.name.clone(), number, total);
            let span = tracing::info_span!(
                "subtask",
                plugin = %task.plugin,
                task_id = %task.id,
                name = %meta.name
            );
            if let Err(error) = self.run_subtask(meta, &ctx, number, total).instrument(span).await {
                result = Err(TaskFailure {
                    subtask: Some(meta.name.clone()),
                    error,
                });
                break;
            }
        }

        if let Err(e) = plugin.close_task(&task_ctx, &data).await {
            tracing::warn!(error = %e, task_id = %task.id, "close task failed");
        }
        result
    }

    async fn run_subtask(&self, meta: &SubTaskMeta, ctx: &SubTaskContext, number: u32, total: u32) -> Result<()> {
        let began = Utc::now();
        let progress = TaskProgress {
            current_sub_task: Some(meta.name.clone()),
            sub_task_number: number,
            sub_task_total: total,
            ..Default::default()
        };
        if let Err(e) = self.meta.update_task_progress(ctx.task().task_id, &progress).await {
            tracing::warn!(error = %e, "progress update failed");
        }
        tracing::info!(number, total, "executing subtask");

        let res = meta
            .entry_point
            .execute(ctx)
            .await
            .map_err(|e| e.context(format!("subtask {} ended unexpectedly", meta.name)));
        ctx.flush_progress().await;

        let finished = Utc::now();
        let record = SubTaskRecord {
            task_id: ctx.task().task_id,
            name: meta.name.clone(),
            number,
            began_at: began,
            finished_at: Some(finished),
            spent_seconds: spent_seconds(Some(began), finished),
            is_failed: res.is_err(),
            message: res.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = self.meta.insert_subtask_record(&record).await {
            tracing::warn!(error = %e, "recording subtask failed");
        }
        match &res {
            Ok(()) => tracing::info!(spent_seconds = record.spent_seconds, "subtask finished"),
            Err(e) => tracing::warn!(error = %e, "subtask failed"),
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::models::{NewPipeline, NewTask, PipelineTask};
    use crate::storage::memory::MemoryStore;
    use crate::test_support::{self, FixturePlugin};
    use crate::registry::traits::Plugin;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn names(metas: &[SubTaskMeta]) -> Vec<&str> {
        metas.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn selection_follows_defaults_names_and_policy() {
        let metas = FixturePlugin::default().subtask_metas();
        let policy = SyncPolicy::default();

        let all = select_subtasks(&metas, &[], &policy).unwrap();
        assert_eq!(names(&all), ["collectItems", "extractItems", "convertItems"]);

        let picked = select_subtasks(&metas, &["enrichItems".to_string()], &policy).unwrap();
        assert_eq!(names(&picked), ["extractItems", "enrichItems"]);

        let skip = SyncPolicy {
            skip_collectors: true,
            ..Default::default()
        };
        let no_collect = select_subtasks(&metas, &[], &skip).unwrap();
        assert_eq!(names(&no_collect), ["extractItems", "convertItems"]);

        let err = select_subtasks(&metas, &["collectBoards".to_string()], &policy).unwrap_err();
        assert_eq!(err.to_string(), "invalid input: subtask collectBoards does not exist");
    }

    async fn setup(options: Value) -> (TaskRunner, MemoryStore, Arc<FixturePlugin>, TaskId) {
        let store = MemoryStore::new();
        let (registry, plugin) = test_support::fixture_registry();
        let (_, tasks) = store
            .create_pipeline(
                &NewPipeline {
                    name: "t".into(),
                    plan: vec![vec![PipelineTask::new("fixture", options.clone())]],
                    ..Default::default()
                },
                &[NewTask {
                    pipeline_row: 1,
                    pipeline_col: 1,
                    plugin: "fixture".into(),
                    subtasks: vec![],
                    options,
                    status: Status::Created,
                }],
            )
            .await
            .unwrap();
        let runner = TaskRunner::new(
            registry,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(ApiClientPool::new()),
            Arc::new(EngineConfig::default()),
        );
        (runner, store, plugin, tasks[0].id)
    }

    #[tokio::test]
    async fn completed_task_records_each_subtask() {
        let (runner, store, plugin, id) = setup(json!({"connectionId": 1, "scopeId": "a"})).await;
        let task = runner
            .run_task(id, &SyncPolicy::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, Status::Completed);
        assert!(task.began_at.is_some() && task.finished_at.is_some());
        assert_eq!(plugin.calls(), ["collectItems", "extractItems", "convertItems"]);

        let records = store.list_subtask_records(id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| !r.is_failed));
        assert_eq!(records[2].number, 3);
    }

    #[tokio::test]
    async fn failing_subtask_stops_the_task() {
        let (runner, store, plugin, id) = setup(json!({"failAt": "extractItems"})).await;
        let task = runner
            .run_task(id, &SyncPolicy::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, Status::Failed);
        assert_eq!(task.failed_sub_task.as_deref(), Some("extractItems"));
        assert!(task
            .message
            .as_deref()
            .unwrap()
            .contains("subtask extractItems ended unexpectedly"));
        assert_eq!(task.error_name.as_deref(), Some("Internal"));
        assert_eq!(plugin.calls(), ["collectItems", "extractItems"]);
        assert!(store.list_subtask_records(id).await.unwrap()[1].is_failed);
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_subtask() {
        let (runner, _store, plugin, id) = setup(json!({"connectionId": "x"})).await;
        let task = runner
            .run_task(id, &SyncPolicy::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(task.status, Status::Failed);
        assert_eq!(task.error_name.as_deref(), Some("BadInput"));
        assert!(task.failed_sub_task.is_none());
        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_marks_task_cancelled() {
        let (runner, _store, plugin, id) = setup(json!({"waitAt": "collectItems", "waitMs": 60_000})).await;
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let task = runner.run_task(id, &SyncPolicy::default(), token).await.unwrap();
        assert_eq!(task.status, Status::Cancelled);
        assert_eq!(task.failed_sub_task.as_deref(), Some("collectItems"));
        assert_eq!(plugin.calls(), ["collectItems"]);
    }
}
