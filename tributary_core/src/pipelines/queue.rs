use crate::models::{Pagination, Status};
use crate::pipelines::engine::PipelineOrchestrator;
use crate::pipelines::models::{Pipeline, PipelineQuery};
use crate::storage::traits::PIPELINES_TABLE;
use crate::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const INTERRUPTED_MESSAGE: &str = "The process was terminated unexpectedly";

/// Background loop that starts queued pipelines in id order.
///
/// At most `pipeline_max_parallel` pipelines run at once, and pipelines
/// sharing a `parallel/*` label never run together.
pub struct PipelineQueue {
    orchestrator: Arc<PipelineOrchestrator>,
    slots: Arc<Semaphore>,
}

impl PipelineQueue {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        let slots = Arc::new(Semaphore::new(orchestrator.config().pipeline_max_parallel));
        Self { orchestrator, slots }
    }

    /// Fail everything a previous process left RUNNING.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn recover(&self) -> Result<u64> {
        let n = self
            .orchestrator
            .meta()
            .fail_interrupted(INTERRUPTED_MESSAGE, Utc::now())
            .await?;
        if n > 0 {
            tracing::warn!(pipelines = n, "marked interrupted pipelines as failed");
        }
        Ok(n)
    }

    /// Claim the oldest runnable pipeline and mark it RUNNING.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn dequeue_once(&self) -> Result<Option<Pipeline>> {
        let meta = self.orchestrator.meta();
        let _guard = self
            .orchestrator
            .locks()
            .lock(&[PIPELINES_TABLE], self.orchestrator.config().lock_timeout)
            .await?;

        let all = Pagination {
            page: 1,
            page_size: Pagination::MAX_PAGE_SIZE,
        };
        let (running, _) = meta
            .list_pipelines(&PipelineQuery {
                statuses: vec![Status::Running],
                pagination: all,
                ..Default::default()
            })
            .await?;
        let busy: HashSet<String> = running
            .iter()
            .flat_map(|p| p.parallel_labels().map(str::to_string))
            .collect();

        let (pending, _) = meta
            .list_pipelines(&PipelineQuery {
                statuses: vec![Status::Created, Status::Rerun],
                ascending: true,
                pagination: all,
                ..Default::default()
            })
            .await?;
        let Some(mut next) = pending
            .into_iter()
            .find(|p| !p.parallel_labels().any(|l| busy.contains(l)))
        else {
            return Ok(None);
        };

        next.status = Status::Running;
        next.began_at = Some(Utc::now());
        next.finished_at = None;
        meta.update_pipeline(&next).await?;
        self.orchestrator.arm(next.id);
        tracing::info!(pipeline_id = %next.id, "pipeline dequeued");
        Ok(Some(next))
    }

    /// Start pipelines until `shutdown` fires. Submissions wake the loop early.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let wake = self.orchestrator.notifier();
        let poll = self.orchestrator.config().pipeline_poll_interval;
        loop {
            let permit = tokio::select! {
                p = self.slots.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };
            match self.dequeue_once().await {
                Ok(Some(p)) => {
                    let orchestrator = self.orchestrator.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = orchestrator.run_pipeline(p.id).await {
                            tracing::warn!(error = %e, pipeline_id = %p.id, "pipeline run failed");
                        }
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "dequeue failed");
                }
            }
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        tracing::info!("pipeline queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::client::ApiClientPool;
    use crate::config::EngineConfig;
    use crate::pipelines::models::{NewPipeline, PipelineTask};
    use crate::runner::TaskRunner;
    use crate::storage::lock::TableLocks;
    use crate::storage::memory::MemoryStore;
    use crate::storage::traits::MetaStore;
    use crate::test_support;
    use serde_json::json;
    use std::time::Duration;

    fn queue(store: &MemoryStore) -> Arc<PipelineQueue> {
        let (registry, _) = test_support::fixture_registry();
        let config = Arc::new(EngineConfig::default());
        let runner = Arc::new(TaskRunner::new(
            registry,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(ApiClientPool::new()),
            config.clone(),
        ));
        let o = Arc::new(PipelineOrchestrator::new(
            Arc::new(store.clone()),
            runner,
            Arc::new(TableLocks::new()),
            config,
        ));
        Arc::new(PipelineQueue::new(o))
    }

    fn labelled(labels: &[&str]) -> NewPipeline {
        NewPipeline {
            name: "q".into(),
            plan: vec![vec![PipelineTask::new("fixture", json!({}))]],
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dequeues_in_id_order_and_respects_parallel_labels() {
        let store = MemoryStore::new();
        let q = queue(&store);
        let a = q.orchestrator.submit(labelled(&["parallel/jira"])).await.unwrap();
        let b = q.orchestrator.submit(labelled(&["parallel/jira"])).await.unwrap();
        let c = q.orchestrator.submit(labelled(&["team"])).await.unwrap();

        assert_eq!(q.dequeue_once().await.unwrap().unwrap().id, a.id);
        // b shares a busy parallel label with a
        let next = q.dequeue_once().await.unwrap().unwrap();
        assert_eq!(next.id, c.id);
        assert_eq!(next.status, Status::Running);
        assert!(next.began_at.is_some());
        assert!(q.dequeue_once().await.unwrap().is_none());

        let mut done = q.orchestrator.get(a.id).await.unwrap();
        done.status = Status::Completed;
        store.update_pipeline(&done).await.unwrap();
        assert_eq!(q.dequeue_once().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn recover_fails_interrupted_runs() {
        let store = MemoryStore::new();
        let q = queue(&store);
        let p = q.orchestrator.submit(labelled(&[])).await.unwrap();
        q.dequeue_once().await.unwrap();
        assert_eq!(q.recover().await.unwrap(), 1);
        let p = q.orchestrator.get(p.id).await.unwrap();
        assert_eq!(p.status, Status::Failed);
        assert_eq!(p.message.as_deref(), Some(INTERRUPTED_MESSAGE));
    }

    #[tokio::test]
    async fn loop_runs_submitted_pipelines() {
        let store = MemoryStore::new();
        let q = queue(&store);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(q.clone().run_loop(shutdown.clone()));

        let p = q.orchestrator.submit(labelled(&[])).await.unwrap();
        let mut status = Status::Created;
        for _ in 0..400 {
            status = q.orchestrator.get(p.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, Status::Completed);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
