use crate::collector::client::ApiClientPool;
use crate::config::EngineConfig;
use crate::models::{PipelineId, SyncPolicy, TaskId};
use crate::pipelines::models::TaskProgress;
use crate::storage::traits::{MetaStore, RecordStore};
use crate::{Error, Result};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Plugin-owned state built once per task by `Plugin::prepare_task_data`.
pub type TaskData = Arc<dyn Any + Send + Sync>;

const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Everything a running task shares with its subtasks.
pub struct TaskContext {
    pub task_id: TaskId,
    pub pipeline_id: PipelineId,
    pub plugin: String,
    pub options: Value,
    pub sync_policy: SyncPolicy,
    pub meta: Arc<dyn MetaStore>,
    pub records: Arc<dyn RecordStore>,
    pub clients: Arc<ApiClientPool>,
    pub config: Arc<EngineConfig>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("pipeline_id", &self.pipeline_id)
            .field("plugin", &self.plugin)
            .field("sync_policy", &self.sync_policy)
            .finish_non_exhaustive()
    }
}

/// Handed to a single subtask execution.
///
/// Progress counters are atomics so concurrent page fetches can report
/// without locking; persistence is throttled to one write per second.
pub struct SubTaskContext {
    task: Arc<TaskContext>,
    data: TaskData,
    name: String,
    number: u32,
    total: u32,
    finished: AtomicU64,
    expected: AtomicU64,
    last_flush: Mutex<Option<Instant>>,
}

impl SubTaskContext {
    pub fn new(task: Arc<TaskContext>, data: TaskData, name: impl Into<String>, number: u32, total: u32) -> Self {
        Self {
            task,
            data,
            name: name.into(),
            number,
            total,
            finished: AtomicU64::new(0),
            expected: AtomicU64::new(UNKNOWN_TOTAL),
            last_flush: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    pub fn plugin(&self) -> &str {
        &self.task.plugin
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.task.meta
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.task.records
    }

    pub fn sync_policy(&self) -> &SyncPolicy {
        &self.task.sync_policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.task.cancel
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.task.is_cancelled() {
            return Err(Error::Cancelled(format!("subtask {} cancelled", self.name)));
        }
        Ok(())
    }

    /// Downcast the task data prepared by the plugin.
    pub fn data<T: Any + Send + Sync>(&self) -> Result<&T> {
        self.data.downcast_ref::<T>().ok_or_else(|| {
            Error::BackendMessage(format!(
                "task data of plugin {} is not a {}",
                self.task.plugin,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn progress(&self) -> TaskProgress {
        let finished = self.finished.load(Ordering::Relaxed);
        let total = match self.expected.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => None,
            t => Some(t),
        };
        let progress_percent = total
            .filter(|t| *t > 0)
            .map(|t| ((finished as f64 / t as f64) * 100.0).min(100.0));
        TaskProgress {
            current_sub_task: Some(self.name.clone()),
            sub_task_number: self.number,
            sub_task_total: self.total,
            finished_records: finished,
            total_records: total,
            progress_percent,
        }
    }

    pub async fn set_progress(&self, finished: u64, total: Option<u64>) {
        self.finished.store(finished, Ordering::Relaxed);
        self.expected
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
        self.maybe_flush().await;
    }

    pub async fn inc_progress(&self, n: u64) {
        self.finished.fetch_add(n, Ordering::Relaxed);
        self.maybe_flush().await;
    }

    async fn maybe_flush(&self) {
        let due = {
            let mut last = match self.last_flush.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let due = last.is_none_or(|t| now.duration_since(t) >= PROGRESS_FLUSH_INTERVAL);
            if due {
                *last = Some(now);
            }
            due
        };
        if due {
            self.flush_progress().await;
        }
    }

    /// Persist the current progress; failures are logged, never raised.
    pub async fn flush_progress(&self) {
        let progress = self.progress();
        if let Err(e) = self
            .task
            .meta
            .update_task_progress(self.task.task_id, &progress)
            .await
        {
            tracing::warn!(error = %e, task_id = %self.task.task_id, subtask = %self.name, "progress update failed");
        }
    }
}

impl std::fmt::Debug for SubTaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubTaskContext")
            .field("task", &self.task)
            .field("name", &self.name)
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support;
    use crate::Error;

    #[tokio::test]
    async fn progress_percent_and_data_downcast() {
        let (ctx, _store) = test_support::subtask_ctx(serde_json::json!({})).await;
        ctx.set_progress(5, Some(20)).await;
        ctx.inc_progress(5).await;
        let p = ctx.progress();
        assert_eq!(p.finished_records, 10);
        assert_eq!(p.progress_percent, Some(50.0));

        assert!(ctx.data::<test_support::FixtureData>().is_ok());
        assert!(matches!(ctx.data::<String>(), Err(Error::BackendMessage(_))));
    }

    #[tokio::test]
    async fn cancellation_is_observed() {
        let (ctx, _store) = test_support::subtask_ctx(serde_json::json!({})).await;
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel_token().cancel();
        assert!(ctx.check_cancelled().unwrap_err().is_cancelled());
    }
}
