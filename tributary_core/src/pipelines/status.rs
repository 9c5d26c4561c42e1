use crate::models::Status;
use crate::pipelines::models::Task;
use std::collections::BTreeMap;

/// The newest task row per (row, col); rerun rows shadow the originals.
/// Result is ordered by position.
pub fn latest_tasks(tasks: &[Task]) -> Vec<Task> {
    let mut latest: BTreeMap<(u32, u32), &Task> = BTreeMap::new();
    for t in tasks {
        latest
            .entry(t.position())
            .and_modify(|cur| {
                if t.id > cur.id {
                    *cur = t;
                }
            })
            .or_insert(t);
    }
    latest.into_values().cloned().collect()
}

/// Aggregate pipeline status over the latest task per position.
///
/// Without `skip_on_fail` any failure fails the pipeline, even while other
/// tasks are still pending. Otherwise pending tasks keep it RUNNING, and a
/// finished mix with at least one completed task is PARTIAL.
pub fn compute_pipeline_status(tasks: &[Task], skip_on_fail: bool) -> Status {
    let statuses: Vec<Status> = latest_tasks(tasks).iter().map(|t| t.status).collect();
    status_of(&statuses, skip_on_fail)
}

pub(crate) fn status_of(statuses: &[Status], skip_on_fail: bool) -> Status {
    let any = |s: Status| statuses.iter().any(|x| *x == s);
    if !skip_on_fail && any(Status::Failed) {
        return Status::Failed;
    }
    if statuses.iter().any(|s| !s.is_terminal()) {
        return Status::Running;
    }
    if statuses.iter().all(|s| *s == Status::Completed) {
        return Status::Completed;
    }
    if any(Status::Completed) {
        return Status::Partial;
    }
    if any(Status::Failed) {
        return Status::Failed;
    }
    Status::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PipelineId, TaskId};
    use crate::pipelines::models::TaskProgress;
    use chrono::Utc;
    use serde_json::json;

    fn task(id: u64, col: u32, status: Status) -> Task {
        Task {
            id: TaskId(id),
            pipeline_id: PipelineId(1),
            pipeline_row: 1,
            pipeline_col: col,
            plugin: "github".into(),
            subtasks: vec![],
            options: json!({}),
            status,
            message: None,
            error_name: None,
            failed_sub_task: None,
            progress: TaskProgress::default(),
            created_at: Utc::now(),
            began_at: None,
            finished_at: None,
            spent_seconds: None,
        }
    }

    fn three(a: Status, b: Status, c: Status) -> Vec<Task> {
        vec![task(1, 1, a), task(2, 2, b), task(3, 3, c)]
    }

    #[test]
    fn failure_wins_without_skip_on_fail() {
        let tasks = three(Status::Completed, Status::Failed, Status::Created);
        assert_eq!(compute_pipeline_status(&tasks, false), Status::Failed);

        let tasks = three(Status::Completed, Status::Completed, Status::Completed);
        assert_eq!(compute_pipeline_status(&tasks, false), Status::Completed);
    }

    #[test]
    fn skip_on_fail_mixtures() {
        let done = three(Status::Completed, Status::Completed, Status::Completed);
        assert_eq!(compute_pipeline_status(&done, true), Status::Completed);

        let one_failed = three(Status::Completed, Status::Failed, Status::Completed);
        assert_eq!(compute_pipeline_status(&one_failed, true), Status::Partial);

        let all_failed = three(Status::Failed, Status::Failed, Status::Failed);
        assert_eq!(compute_pipeline_status(&all_failed, true), Status::Failed);

        let pending = three(Status::Completed, Status::Failed, Status::Running);
        assert_eq!(compute_pipeline_status(&pending, true), Status::Running);
    }

    #[test]
    fn reruns_shadow_original_rows() {
        let mut tasks = three(Status::Failed, Status::Failed, Status::Failed);
        tasks.extend([
            task(4, 1, Status::Completed),
            task(5, 2, Status::Completed),
            task(6, 3, Status::Completed),
        ]);
        assert_eq!(compute_pipeline_status(&tasks, true), Status::Completed);
        assert_eq!(compute_pipeline_status(&tasks, false), Status::Completed);

        tasks[5].status = Status::Cancelled;
        assert_eq!(compute_pipeline_status(&tasks, true), Status::Partial);

        let latest = latest_tasks(&tasks);
        assert_eq!(latest.len(), 3);
        assert_eq!(
            latest.iter().map(|t| t.id.0).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );
    }

    #[test]
    fn empty_and_cancelled() {
        assert_eq!(status_of(&[], false), Status::Completed);
        assert_eq!(
            status_of(&[Status::Cancelled, Status::Cancelled], false),
            Status::Cancelled
        );
    }
}
