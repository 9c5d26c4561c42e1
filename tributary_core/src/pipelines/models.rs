use crate::models::{BlueprintId, Pagination, PipelineId, Status, SyncPolicy, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One plugin invocation inside a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    pub plugin: String,
    /// Explicit subtask selection. Empty means the plugin defaults.
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub options: Value,
}

impl PipelineTask {
    pub fn new(plugin: impl Into<String>, options: Value) -> Self {
        Self {
            plugin: plugin.into(),
            subtasks: Vec::new(),
            options,
        }
    }
}

/// Tasks meant to run concurrently. Stages execute as strict barriers.
pub type PipelineStage = Vec<PipelineTask>;

/// Ordered list of stages.
pub type PipelinePlan = Vec<PipelineStage>;

/// Total number of tasks across all stages.
pub fn plan_task_count(plan: &PipelinePlan) -> usize {
    plan.iter().map(|stage| stage.len()).sum()
}

/// Submission payload for a new pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPipeline {
    pub name: String,
    pub plan: PipelinePlan,
    #[serde(default)]
    pub blueprint_id: Option<BlueprintId>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, flatten)]
    pub sync_policy: SyncPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub blueprint_id: Option<BlueprintId>,
    pub plan: PipelinePlan,
    pub status: Status,
    pub total_tasks: u64,
    pub finished_tasks: u64,
    pub labels: Vec<String>,
    #[serde(flatten)]
    pub sync_policy: SyncPolicy,
    pub message: Option<String>,
    pub error_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub began_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spent_seconds: Option<i64>,
}

impl Pipeline {
    /// Labels of the form `parallel/<name>` serialize pipelines sharing them.
    pub fn parallel_labels(&self) -> impl Iterator<Item = &str> {
        self.labels
            .iter()
            .map(String::as_str)
            .filter(|l| l.starts_with(PARALLEL_LABEL_PREFIX))
    }
}

pub const PARALLEL_LABEL_PREFIX: &str = "parallel/";

/// Live progress of a task, persisted as subtasks advance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskProgress {
    pub current_sub_task: Option<String>,
    pub sub_task_number: u32,
    pub sub_task_total: u32,
    pub finished_records: u64,
    pub total_records: Option<u64>,
    pub progress_percent: Option<f64>,
}

/// Task row to insert. Position is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub pipeline_row: u32,
    pub pipeline_col: u32,
    pub plugin: String,
    pub subtasks: Vec<String>,
    pub options: Value,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub pipeline_id: PipelineId,
    pub pipeline_row: u32,
    pub pipeline_col: u32,
    pub plugin: String,
    pub subtasks: Vec<String>,
    pub options: Value,
    pub status: Status,
    pub message: Option<String>,
    pub error_name: Option<String>,
    pub failed_sub_task: Option<String>,
    pub progress: TaskProgress,
    pub created_at: DateTime<Utc>,
    pub began_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spent_seconds: Option<i64>,
}

impl Task {
    pub fn position(&self) -> (u32, u32) {
        (self.pipeline_row, self.pipeline_col)
    }
}

/// Execution record of one subtask inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskRecord {
    pub task_id: TaskId,
    pub name: String,
    pub number: u32,
    pub began_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spent_seconds: Option<i64>,
    pub is_failed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineQuery {
    pub statuses: Vec<Status>,
    pub blueprint_id: Option<BlueprintId>,
    pub label: Option<String>,
    /// Oldest first. The queue dequeues in id order.
    pub ascending: bool,
    #[serde(flatten)]
    pub pagination: Pagination,
}

/// Response shape for `GET /pipelines`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineList {
    pub pipelines: Vec<Pipeline>,
    pub count: u64,
}

/// Seconds between two instants, floored at zero.
pub(crate) fn spent_seconds(began: Option<DateTime<Utc>>, finished: DateTime<Utc>) -> Option<i64> {
    began.map(|b| (finished - b).num_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_pipeline_flattens_sync_policy() {
        let np: NewPipeline = serde_json::from_value(json!({
            "name": "demo",
            "plan": [[{"plugin": "github", "options": {"connectionId": 1}}]],
            "skipOnFail": true
        }))
        .unwrap();
        assert!(np.sync_policy.skip_on_fail);
        assert_eq!(plan_task_count(&np.plan), 1);
        assert!(np.plan[0][0].subtasks.is_empty());
    }
}
