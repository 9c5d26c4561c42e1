use crate::models::Status;
use crate::storage::traits::{MetaStore, PIPELINES_TABLE};
use crate::{Error, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive, process-wide table locks with acquisition timeout.
///
/// Tables are always locked in sorted order so two callers asking for
/// overlapping sets cannot deadlock.
#[derive(Default)]
pub struct TableLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Releases every held table lock on drop.
pub struct TableLockGuard {
    tables: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl TableLockGuard {
    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

impl std::fmt::Debug for TableLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableLockGuard")
            .field("tables", &self.tables)
            .finish()
    }
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn lock(&self, tables: &[&str], timeout: Duration) -> Result<TableLockGuard> {
        let mut names: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        names.sort();
        names.dedup();

        let mutexes: Vec<Arc<Mutex<()>>> = names
            .iter()
            .map(|n| self.locks.entry(n.clone()).or_default().clone())
            .collect();

        let acquire = async move {
            let mut guards = Vec::with_capacity(mutexes.len());
            for m in mutexes {
                guards.push(m.lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(timeout, acquire).await {
            Ok(guards) => Ok(TableLockGuard {
                tables: names,
                _guards: guards,
            }),
            Err(_) => {
                tracing::warn!(tables = ?names, timeout_ms = timeout.as_millis() as u64, "table lock timed out");
                Err(Error::Conflict(format!(
                    "lock {} table timedout",
                    names.join(", ")
                )))
            }
        }
    }
}

/// Guard for destructive operations that must not race with a running pipeline.
#[derive(Clone)]
pub struct PipelineGuard {
    meta: Arc<dyn MetaStore>,
    locks: Arc<TableLocks>,
    timeout: Duration,
}

impl PipelineGuard {
    pub fn new(meta: Arc<dyn MetaStore>, locks: Arc<TableLocks>, timeout: Duration) -> Self {
        Self {
            meta,
            locks,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lock the given tables with the configured timeout.
    pub async fn lock_tables(&self, tables: &[&str]) -> Result<TableLockGuard> {
        self.locks.lock(tables, self.timeout).await
    }

    /// Lock the pipelines table (plus `extra_tables`), require zero RUNNING
    /// pipelines, then run `f` while the locks are held.
    ///
    /// `f` is expected to perform its writes in a single storage transaction.
    #[tracing::instrument(level = "debug", skip(self, f))]
    pub async fn with_no_running_pipeline<T, F, Fut>(&self, extra_tables: &[&str], f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut tables = vec![PIPELINES_TABLE];
        tables.extend_from_slice(extra_tables);
        let _guard = self.lock_tables(&tables).await?;

        let running = self.meta.count_pipelines(&[Status::Running]).await?;
        if running > 0 {
            return Err(Error::Conflict("at least one pipeline is running".to_string()));
        }
        f().await
    }
}
