use crate::config::EngineConfig;
use crate::models::{PipelineId, Status, SyncPolicy, TaskId};
use crate::pipelines::models::{
    NewPipeline, NewTask, Pipeline, PipelineList, PipelinePlan, PipelineQuery, Task, spent_seconds,
};
use crate::pipelines::status::{compute_pipeline_status, latest_tasks};
use crate::registry::plugins::PluginRegistry;
use crate::runner::TaskRunner;
use crate::storage::lock::TableLocks;
use crate::storage::traits::{MetaStore, PIPELINES_TABLE, TASKS_TABLE};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const CANCELLED_MESSAGE: &str = "cancelled by user";
const ABORTED_MESSAGE: &str = "an earlier task failed";

/// Owns pipeline submission, execution, cancellation and reruns.
///
/// Stages run as barriers; tasks inside a stage share a bounded worker pool.
/// Live cancellation tokens are kept per running pipeline.
pub struct PipelineOrchestrator {
    meta: Arc<dyn MetaStore>,
    registry: Arc<PluginRegistry>,
    runner: Arc<TaskRunner>,
    locks: Arc<TableLocks>,
    config: Arc<EngineConfig>,
    task_slots: Arc<Semaphore>,
    tokens: DashMap<PipelineId, CancellationToken>,
    wake: Arc<Notify>,
}

impl PipelineOrchestrator {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        meta: Arc<dyn MetaStore>,
        runner: Arc<TaskRunner>,
        locks: Arc<TableLocks>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            meta,
            registry: runner.registry().clone(),
            runner,
            locks,
            task_slots: Arc::new(Semaphore::new(config.task_max_parallel)),
            config,
            tokens: DashMap::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever a pipeline becomes runnable.
    pub fn notifier(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub fn locks(&self) -> &Arc<TableLocks> {
        &self.locks
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Expand a plan into task rows, rejecting unknown plugins and subtasks.
    pub fn plan_tasks(&self, plan: &PipelinePlan) -> Result<Vec<NewTask>> {
        let mut tasks = Vec::new();
        for (row, stage) in plan.iter().enumerate() {
            for (col, t) in stage.iter().enumerate() {
                let plugin = self
                    .registry
                    .get(&t.plugin)
                    .map_err(|_| Error::InvalidInput(format!("plugin {} is not registered", t.plugin)))?;
                if !t.subtasks.is_empty() {
                    let metas = plugin.subtask_metas();
                    if let Some(unknown) = t.subtasks.iter().find(|n| !metas.iter().any(|m| &m.name == *n)) {
                        return Err(Error::InvalidInput(format!(
                            "subtask {unknown} does not exist in plugin {}",
                            t.plugin
                        )));
                    }
                }
                tasks.push(NewTask {
                    pipeline_row: row as u32 + 1,
                    pipeline_col: col as u32 + 1,
                    plugin: t.plugin.clone(),
                    subtasks: t.subtasks.clone(),
                    options: t.options.clone(),
                    status: Status::Created,
                });
            }
        }
        if tasks.is_empty() {
            return Err(Error::InvalidInput("no task to run".to_string()));
        }
        Ok(tasks)
    }

    /// Persist a pipeline with one task row per plan position and wake the queue.
    #[tracing::instrument(level = "info", skip(self, new), fields(name = %new.name))]
    pub async fn submit(&self, new: NewPipeline) -> Result<Pipeline> {
        let tasks = self.plan_tasks(&new.plan)?;

        let guard = self.locks.lock(&[PIPELINES_TABLE], self.config.lock_timeout).await?;
        if let Some(bp) = new.blueprint_id {
            let (_, pending) = self
                .meta
                .list_pipelines(&PipelineQuery {
                    statuses: vec![Status::Created, Status::Rerun],
                    blueprint_id: Some(bp),
                    ..Default::default()
                })
                .await?;
            if pending > 0 {
                return Err(Error::Conflict(format!(
                    "blueprint {bp} already has a pipeline waiting to run"
                )));
            }
        }
        let (pipeline, _) = self.meta.create_pipeline(&new, &tasks).await?;
        drop(guard);

        self.wake.notify_one();
        tracing::info!(pipeline_id = %pipeline.id, total_tasks = pipeline.total_tasks, "pipeline submitted");
        Ok(pipeline)
    }

    pub async fn get(&self, id: PipelineId) -> Result<Pipeline> {
        self.meta
            .get_pipeline(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pipeline {id}")))
    }

    pub async fn list(&self, query: &PipelineQuery) -> Result<PipelineList> {
        let (pipelines, count) = self.meta.list_pipelines(query).await?;
        Ok(PipelineList { pipelines, count })
    }

    /// Every task row of the pipeline, reruns included.
    pub async fn tasks(&self, id: PipelineId) -> Result<Vec<Task>> {
        self.get(id).await?;
        self.meta.list_tasks(id).await
    }

    /// Cancel a pending or running pipeline. Terminal pipelines are left as they are.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn cancel(&self, id: PipelineId) -> Result<Pipeline> {
        let p = self.get(id).await?;
        if p.status.is_terminal() {
            return Ok(p);
        }
        // Held across the decision so a rerun or dequeue cannot slip in between.
        let _guard = self
            .locks
            .lock(&[PIPELINES_TABLE, TASKS_TABLE], self.config.lock_timeout)
            .await?;
        let mut p = self.get(id).await?;
        if p.status.is_terminal() {
            return Ok(p);
        }
        if p.status.is_pending() {
            self.cancel_pending_tasks(id, CANCELLED_MESSAGE).await?;
            let now = Utc::now();
            p.status = Status::Cancelled;
            p.message = Some(CANCELLED_MESSAGE.to_string());
            p.finished_at = Some(now);
            p.spent_seconds = spent_seconds(p.began_at, now);
            self.meta.update_pipeline(&p).await?;
            tracing::info!(pipeline_id = %id, "pending pipeline cancelled");
            return Ok(p);
        }
        // The runner may not have registered its token yet; it picks this one up.
        self.tokens.entry(id).or_default().cancel();
        let p = self.get(id).await?;
        if p.status.is_terminal() {
            // the run finished first and already dropped its token
            self.tokens.remove(&id);
            return Ok(p);
        }
        tracing::info!(pipeline_id = %id, "running pipeline cancelled");
        Ok(p)
    }

    /// Re-create every task whose latest row did not complete and queue the pipeline again.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn rerun(&self, id: PipelineId) -> Result<Vec<Task>> {
        let _guard = self
            .locks
            .lock(&[PIPELINES_TABLE, TASKS_TABLE], self.config.lock_timeout)
            .await?;
        let p = self.get(id).await?;
        if p.status == Status::Running {
            return Err(Error::Conflict("pipeline is running".to_string()));
        }
        if p.status.is_pending() {
            return Err(Error::Conflict("pipeline is waiting to run".to_string()));
        }

        let tasks = self.meta.list_tasks(id).await?;
        let rerun: Vec<NewTask> = latest_tasks(&tasks)
            .into_iter()
            .filter(|t| t.status != Status::Completed)
            .map(|t| NewTask {
                pipeline_row: t.pipeline_row,
                pipeline_col: t.pipeline_col,
                plugin: t.plugin,
                subtasks: t.subtasks,
                options: t.options,
                status: Status::Rerun,
            })
            .collect();
        if rerun.is_empty() {
            return Err(Error::InvalidInput("no tasks to be re-ran".to_string()));
        }
        let created = self.meta.insert_rerun_tasks(id, &rerun).await?;
        // nothing is running, so any token left here belongs to a finished run
        self.tokens.remove(&id);
        self.wake.notify_one();
        tracing::info!(pipeline_id = %id, tasks = created.len(), "pipeline queued for rerun");
        Ok(created)
    }

    /// Give a freshly dequeued pipeline a new token, replacing any stale one.
    pub(crate) fn arm(&self, id: PipelineId) {
        self.tokens.insert(id, CancellationToken::new());
    }

    /// Execute the pipeline's pending tasks stage by stage and persist the final status.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_pipeline(&self, id: PipelineId) -> Result<Pipeline> {
        let token = self.tokens.entry(id).or_default().clone();
        let res = self.drive(id, &token).await;
        self.tokens.remove(&id);
        if let Err(e) = &res {
            tracing::warn!(error = %e, pipeline_id = %id, "pipeline run aborted");
        }
        res
    }

    async fn drive(&self, id: PipelineId, token: &CancellationToken) -> Result<Pipeline> {
        let mut pipeline = self.get(id).await?;
        if pipeline.status.is_terminal() {
            return Ok(pipeline);
        }
        if pipeline.status != Status::Running {
            pipeline.status = Status::Running;
            pipeline.began_at = Some(Utc::now());
            self.meta.update_pipeline(&pipeline).await?;
        }
        let policy = pipeline.sync_policy.clone();

        let mut stages: BTreeMap<u32, Vec<Task>> = BTreeMap::new();
        for t in latest_tasks(&self.meta.list_tasks(id).await?) {
            stages.entry(t.pipeline_row).or_default().push(t);
        }

        for (row, tasks) in stages {
            if token.is_cancelled() {
                break;
            }
            let runnable: Vec<TaskId> = tasks
                .iter()
                .filter(|t| t.status.is_pending())
                .map(|t| t.id)
                .collect();
            if runnable.is_empty() {
                continue;
            }
            tracing::info!(pipeline_id = %id, stage = row, tasks = runnable.len(), "stage started");
            let failed = self.run_stage(&runnable, &policy, token).await;
            self.update_finished_count(id).await?;
            if failed && !policy.skip_on_fail {
                tracing::warn!(pipeline_id = %id, stage = row, "stage failed, skipping remaining stages");
                break;
            }
        }

        let reason = if token.is_cancelled() {
            CANCELLED_MESSAGE
        } else {
            ABORTED_MESSAGE
        };
        self.cancel_pending_tasks(id, reason).await?;
        self.finalize(id, &policy, token.is_cancelled()).await
    }

    /// Run one stage to completion. Returns whether any task failed.
    async fn run_stage(&self, ids: &[TaskId], policy: &SyncPolicy, token: &CancellationToken) -> bool {
        let mut set = JoinSet::new();
        for &task_id in ids {
            let runner = self.runner.clone();
            let slots = self.task_slots.clone();
            let policy = policy.clone();
            let token = token.child_token();
            set.spawn(async move {
                let _permit = tokio::select! {
                    p = slots.acquire_owned() => Some(p.map_err(|e| Error::backend("acquire task slot", e))?),
                    _ = token.cancelled() => None,
                };
                runner.run_task(task_id, &policy, token).await
            });
        }

        let mut failed = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(task)) => failed |= task.status == Status::Failed,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "task could not be run");
                    failed = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "task panicked or was aborted");
                    failed = true;
                }
            }
        }
        failed
    }

    async fn update_finished_count(&self, id: PipelineId) -> Result<()> {
        let done = latest_tasks(&self.meta.list_tasks(id).await?)
            .iter()
            .filter(|t| t.status == Status::Completed)
            .count() as u64;
        let mut p = self.get(id).await?;
        p.finished_tasks = done;
        self.meta.update_pipeline(&p).await
    }

    /// Latest task rows that never started become CANCELLED; rows left
    /// RUNNING by a crashed runner become FAILED.
    async fn cancel_pending_tasks(&self, id: PipelineId, message: &str) -> Result<u64> {
        let now = Utc::now();
        let mut n = 0;
        for mut t in latest_tasks(&self.meta.list_tasks(id).await?) {
            if t.status.is_terminal() {
                continue;
            }
            t.status = if t.status.is_pending() {
                Status::Cancelled
            } else {
                Status::Failed
            };
            t.message = Some(message.to_string());
            t.finished_at = Some(now);
            t.spent_seconds = spent_seconds(t.began_at, now);
            self.meta.update_task(&t).await?;
            n += 1;
        }
        Ok(n)
    }

    async fn finalize(&self, id: PipelineId, policy: &SyncPolicy, cancelled: bool) -> Result<Pipeline> {
        let tasks = self.meta.list_tasks(id).await?;
        let latest = latest_tasks(&tasks);
        let mut p = self.get(id).await?;
        let now = Utc::now();
        p.status = if cancelled {
            Status::Cancelled
        } else {
            compute_pipeline_status(&tasks, policy.skip_on_fail)
        };
        p.finished_tasks = latest.iter().filter(|t| t.status == Status::Completed).count() as u64;
        p.finished_at = Some(now);
        p.spent_seconds = spent_seconds(p.began_at, now);
        (p.message, p.error_name) = match p.status {
            Status::Cancelled => (Some(CANCELLED_MESSAGE.to_string()), None),
            Status::Failed | Status::Partial => latest
                .iter()
                .find(|t| t.status == Status::Failed)
                .map(|t| (t.message.clone(), t.error_name.clone()))
                .unwrap_or_default(),
            _ => (None, None),
        };
        self.meta.update_pipeline(&p).await?;
        tracing::info!(
            pipeline_id = %id,
            status = %p.status,
            finished_tasks = p.finished_tasks,
            total_tasks = p.total_tasks,
            "pipeline finished"
        );
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::client::ApiClientPool;
    use crate::models::BlueprintId;
    use crate::pipelines::models::PipelineTask;
    use crate::storage::memory::MemoryStore;
    use crate::test_support::{self, FixturePlugin};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn orchestrator(store: &MemoryStore) -> (PipelineOrchestrator, Arc<FixturePlugin>) {
        let (registry, plugin) = test_support::fixture_registry();
        let config = Arc::new(EngineConfig::default());
        let runner = Arc::new(TaskRunner::new(
            registry,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(ApiClientPool::new()),
            config.clone(),
        ));
        (
            PipelineOrchestrator::new(Arc::new(store.clone()), runner, Arc::new(TableLocks::new()), config),
            plugin,
        )
    }

    fn plan(stages: &[&[Value]]) -> PipelinePlan {
        stages
            .iter()
            .map(|s| s.iter().map(|o| PipelineTask::new("fixture", o.clone())).collect())
            .collect()
    }

    fn new_pipeline(plan: PipelinePlan) -> NewPipeline {
        NewPipeline {
            name: "test".into(),
            plan,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_validates_plan() {
        let store = MemoryStore::new();
        let (o, _) = orchestrator(&store);

        let err = o.submit(new_pipeline(vec![vec![]])).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid input: no task to run");

        let mut bad = plan(&[&[json!({})]]);
        bad[0][0].plugin = "jira".into();
        assert!(matches!(o.submit(new_pipeline(bad)).await, Err(Error::InvalidInput(_))));

        let mut bad = plan(&[&[json!({})]]);
        bad[0][0].subtasks = vec!["collectBoards".into()];
        assert!(matches!(o.submit(new_pipeline(bad)).await, Err(Error::InvalidInput(_))));

        let p = o
            .submit(new_pipeline(plan(&[&[json!({}), json!({})], &[json!({})]])))
            .await
            .unwrap();
        assert_eq!(p.status, Status::Created);
        assert_eq!(p.total_tasks, 3);
        let positions: Vec<(u32, u32)> = o.tasks(p.id).await.unwrap().iter().map(Task::position).collect();
        assert_eq!(positions, vec![(1, 1), (1, 2), (2, 1)]);
    }

    #[tokio::test]
    async fn blueprint_may_not_queue_twice() {
        let store = MemoryStore::new();
        let (o, _) = orchestrator(&store);
        let mut np = new_pipeline(plan(&[&[json!({})]]));
        np.blueprint_id = Some(BlueprintId(7));
        o.submit(np.clone()).await.unwrap();
        assert!(matches!(o.submit(np).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn failed_stage_stops_later_stages() {
        let store = MemoryStore::new();
        let (o, plugin) = orchestrator(&store);
        let p = o
            .submit(new_pipeline(plan(&[&[json!({"failAt": "collectItems"})], &[json!({})]])))
            .await
            .unwrap();
        let done = o.run_pipeline(p.id).await.unwrap();
        assert_eq!(done.status, Status::Failed);
        assert!(done.message.unwrap().contains("collectItems exploded"));
        assert_eq!(plugin.calls(), ["collectItems"]);

        let tasks = o.tasks(p.id).await.unwrap();
        assert_eq!(tasks[0].status, Status::Failed);
        assert_eq!(tasks[1].status, Status::Cancelled);
        assert_eq!(tasks[1].message.as_deref(), Some(ABORTED_MESSAGE));
    }

    #[tokio::test]
    async fn skip_on_fail_runs_every_stage() {
        let store = MemoryStore::new();
        let (o, plugin) = orchestrator(&store);
        let mut np = new_pipeline(plan(&[
            &[json!({"failAt": "convertItems"}), json!({})],
            &[json!({})],
        ]));
        np.sync_policy.skip_on_fail = true;
        let p = o.submit(np).await.unwrap();
        let done = o.run_pipeline(p.id).await.unwrap();
        assert_eq!(done.status, Status::Partial);
        assert_eq!(done.finished_tasks, 2);
        assert_eq!(plugin.calls().iter().filter(|c| *c == "collectItems").count(), 3);
    }

    #[tokio::test]
    async fn rerun_recreates_unfinished_tasks() {
        let store = MemoryStore::new();
        let (o, _) = orchestrator(&store);
        let p = o
            .submit(new_pipeline(plan(&[&[json!({}), json!({"failAt": "extractItems"})], &[json!({})]])))
            .await
            .unwrap();

        let err = o.rerun(p.id).await.unwrap_err();
        assert_eq!(err.to_string(), "conflict: pipeline is waiting to run");

        o.run_pipeline(p.id).await.unwrap();
        let created = o.rerun(p.id).await.unwrap();
        assert_eq!(
            created.iter().map(Task::position).collect::<Vec<_>>(),
            vec![(1, 2), (2, 1)]
        );
        assert!(created.iter().all(|t| t.status == Status::Rerun));
        assert_eq!(o.get(p.id).await.unwrap().status, Status::Rerun);
        assert_eq!(o.tasks(p.id).await.unwrap().len(), 5);

        // the failing task still fails, but only unfinished rows run again
        let again = o.run_pipeline(p.id).await.unwrap();
        assert_eq!(again.status, Status::Failed);
        let latest = latest_tasks(&o.tasks(p.id).await.unwrap());
        assert_eq!(latest[0].status, Status::Completed);
        assert_eq!(latest[0].id, o.tasks(p.id).await.unwrap()[0].id);
    }

    #[tokio::test]
    async fn rerun_of_completed_pipeline_is_rejected() {
        let store = MemoryStore::new();
        let (o, _) = orchestrator(&store);
        let p = o.submit(new_pipeline(plan(&[&[json!({})]]))).await.unwrap();
        assert_eq!(o.run_pipeline(p.id).await.unwrap().status, Status::Completed);
        let err = o.rerun(p.id).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid input: no tasks to be re-ran");
    }

    #[tokio::test]
    async fn cancel_pending_and_terminal() {
        let store = MemoryStore::new();
        let (o, plugin) = orchestrator(&store);
        let p = o.submit(new_pipeline(plan(&[&[json!({})]]))).await.unwrap();
        let cancelled = o.cancel(p.id).await.unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);
        assert_eq!(o.tasks(p.id).await.unwrap()[0].status, Status::Cancelled);

        // terminal: nothing changes and nothing runs
        assert_eq!(o.cancel(p.id).await.unwrap().status, Status::Cancelled);
        assert_eq!(o.run_pipeline(p.id).await.unwrap().status, Status::Cancelled);
        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_after_finish_does_not_leak_into_rerun() {
        let store = MemoryStore::new();
        let (o, _) = orchestrator(&store);
        let p = o
            .submit(new_pipeline(plan(&[&[json!({"failAt": "collectItems"})]])))
            .await
            .unwrap();
        let mut running = o.get(p.id).await.unwrap();
        running.status = Status::Running;
        store.update_pipeline(&running).await.unwrap();
        assert_eq!(o.run_pipeline(p.id).await.unwrap().status, Status::Failed);
        assert!(o.tokens.is_empty());

        // a cancel that saw RUNNING lands after the run dropped its token
        o.tokens.entry(p.id).or_default().cancel();
        assert_eq!(o.cancel(p.id).await.unwrap().status, Status::Failed);

        o.rerun(p.id).await.unwrap();
        assert!(o.tokens.is_empty());
        let again = o.run_pipeline(p.id).await.unwrap();
        assert_eq!(again.status, Status::Failed);
        assert_ne!(again.message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(o.tokens.is_empty());
    }

    #[tokio::test]
    async fn cancel_running_pipeline() {
        let store = MemoryStore::new();
        let (o, _) = orchestrator(&store);
        let o = Arc::new(o);
        let p = o
            .submit(new_pipeline(plan(&[
                &[json!({"waitAt": "collectItems", "waitMs": 60_000})],
                &[json!({})],
            ])))
            .await
            .unwrap();

        let runner = o.clone();
        let handle = tokio::spawn(async move { runner.run_pipeline(p.id).await });
        for _ in 0..200 {
            if o.tasks(p.id).await.unwrap()[0].status == Status::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        o.cancel(p.id).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done.status, Status::Cancelled);
        let tasks = o.tasks(p.id).await.unwrap();
        assert_eq!(tasks[0].status, Status::Cancelled);
        assert_eq!(tasks[1].status, Status::Cancelled);
        assert_eq!(tasks[1].message.as_deref(), Some(CANCELLED_MESSAGE));
    }
}
