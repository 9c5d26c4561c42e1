//! Incremental collection bookkeeping keyed by `(raw table, params)`.

use crate::collector::api_collector::{ApiCollector, ApiCollectorArgs, CollectStats};
use crate::collector::raw::RawDataArgs;
use crate::domain::lineage::canonical_params;
use crate::models::SyncPolicy;
use crate::storage::traits::MetaStore;
use crate::subtask::context::SubTaskContext;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Persisted watermark of the last fully successful collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorState {
    pub raw_data_table: String,
    pub raw_data_params: String,
    /// Start time of the last successful run; the next incremental run resumes here.
    pub latest_success_start: Option<DateTime<Utc>>,
    pub time_after: Option<DateTime<Utc>>,
    /// Canonical subtask config of the last successful run.
    pub prev_config: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CollectorState {
    fn empty(raw: &RawDataArgs, now: DateTime<Utc>) -> Self {
        Self {
            raw_data_table: raw.table().to_string(),
            raw_data_params: raw.params_string().to_string(),
            latest_success_start: None,
            time_after: None,
            prev_config: None,
            updated_at: now,
        }
    }
}

/// Decide full vs incremental, and the lower time bound to collect from.
fn decide(policy: &SyncPolicy, prev: &CollectorState, config: Option<&str>) -> (bool, Option<DateTime<Utc>>) {
    if policy.full_sync {
        return (false, policy.time_after);
    }
    let Some(prev_start) = prev.latest_success_start else {
        return (false, policy.time_after);
    };
    let config_changed = prev
        .prev_config
        .as_deref()
        .is_some_and(|p| !p.is_empty() && Some(p) != config);
    if config_changed {
        return (false, policy.time_after);
    }
    if let (Some(new), Some(old)) = (policy.time_after, prev.time_after) {
        if new < old {
            return (false, policy.time_after);
        }
    }
    (true, Some(prev_start))
}

/// Loads the previous state, decides the collection mode, and persists the
/// new watermark on `close`. Dropping it without `close` leaves the stored
/// state untouched.
#[derive(Clone)]
pub struct CollectorStateManager {
    meta: Arc<dyn MetaStore>,
    state: CollectorState,
    sync_policy: SyncPolicy,
    incremental: bool,
    since: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
    config: Option<String>,
}

impl std::fmt::Debug for CollectorStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorStateManager")
            .field("state", &self.state)
            .field("incremental", &self.incremental)
            .field("since", &self.since)
            .field("until", &self.until)
            .finish_non_exhaustive()
    }
}

impl CollectorStateManager {
    #[tracing::instrument(level = "debug", skip(meta, config))]
    pub async fn load(
        meta: Arc<dyn MetaStore>,
        raw: &RawDataArgs,
        sync_policy: &SyncPolicy,
        config: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let state = meta
            .get_collector_state(raw.table(), raw.params_string())
            .await?
            .unwrap_or_else(|| CollectorState::empty(raw, now));
        let config = config.map(canonical_params);
        let (incremental, since) = decide(sync_policy, &state, config.as_deref());
        let since = since.or(state.time_after);
        tracing::debug!(incremental, since = ?since, "collector mode decided");
        Ok(Self {
            meta,
            state,
            sync_policy: sync_policy.clone(),
            incremental,
            since,
            until: now,
            config,
        })
    }

    pub async fn from_context(ctx: &SubTaskContext, raw: &RawDataArgs, config: Option<&Value>) -> Result<Self> {
        Self::load(ctx.meta().clone(), raw, ctx.sync_policy(), config, Utc::now()).await
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Lower bound for this run; `None` means everything.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// This run's start; becomes the next run's `since` on success.
    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }

    pub fn state(&self) -> &CollectorState {
        &self.state
    }

    /// Persist the watermark. Call only after every nested collector succeeded.
    #[tracing::instrument(level = "debug", skip(self), fields(table = %self.state.raw_data_table))]
    pub async fn close(mut self) -> Result<()> {
        if !self.incremental {
            if let Some(t) = self.sync_policy.time_after {
                self.state.time_after = Some(t);
            }
        }
        self.state.latest_success_start = Some(self.until);
        self.state.prev_config = self.config;
        self.state.updated_at = Utc::now();
        self.meta.save_collector_state(&self.state).await
    }
}

/// A set of collectors sharing one watermark: raw rows are cleared once for a
/// full run and the state only advances when all of them succeed.
pub struct StatefulApiCollector {
    manager: CollectorStateManager,
    collectors: Vec<ApiCollector>,
}

impl StatefulApiCollector {
    pub async fn new(ctx: &SubTaskContext, raw: &RawDataArgs, config: Option<&Value>) -> Result<Self> {
        Ok(Self {
            manager: CollectorStateManager::from_context(ctx, raw, config).await?,
            collectors: Vec::new(),
        })
    }

    pub fn with_manager(manager: CollectorStateManager) -> Self {
        Self {
            manager,
            collectors: Vec::new(),
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.manager.is_incremental()
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.manager.since()
    }

    pub fn add(&mut self, args: ApiCollectorArgs) -> Result<()> {
        if args.raw.table() != self.manager.state.raw_data_table
            || args.raw.params_string() != self.manager.state.raw_data_params
        {
            return Err(Error::InvalidInput(format!(
                "collector for {} does not share the stateful raw table {}",
                args.raw.table(),
                self.manager.state.raw_data_table
            )));
        }
        let mut c = ApiCollector::new(args)?;
        c.set_incremental(true);
        self.collectors.push(c);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.manager.state.raw_data_table, incremental = self.manager.incremental))]
    pub async fn execute(self, ctx: &SubTaskContext) -> Result<CollectStats> {
        if !self.manager.is_incremental() {
            let records = ctx.records();
            records.ensure_raw_table(&self.manager.state.raw_data_table).await?;
            records
                .delete_raw(&self.manager.state.raw_data_table, &self.manager.state.raw_data_params)
                .await?;
        }
        let mut stats = CollectStats::default();
        for c in self.collectors {
            stats += c.execute(ctx).await?;
        }
        self.manager.close().await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::api_collector::{Page, Paging};
    use crate::collector::client::{ApiClient, ApiResponse};
    use crate::collector::template::RequestData;
    use crate::storage::memory::MemoryStore;
    use crate::storage::traits::RecordStore;
    use crate::test_support;
    use axum::Router;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn raw() -> RawDataArgs {
        RawDataArgs::new("fixture", "_api_issues", json!({"ConnectionId": 1, "Name": "a"})).unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn decides_full_then_incremental() {
        let store = MemoryStore::new();
        let meta: Arc<dyn MetaStore> = Arc::new(store.clone());
        let policy = SyncPolicy::default();

        let m = CollectorStateManager::load(meta.clone(), &raw(), &policy, None, at(1)).await.unwrap();
        assert!(!m.is_incremental());
        assert_eq!(m.since(), None);
        m.close().await.unwrap();

        let m = CollectorStateManager::load(meta.clone(), &raw(), &policy, None, at(2)).await.unwrap();
        assert!(m.is_incremental());
        assert_eq!(m.since(), Some(at(1)));

        let full = SyncPolicy {
            full_sync: true,
            ..Default::default()
        };
        let m = CollectorStateManager::load(meta.clone(), &raw(), &full, None, at(2)).await.unwrap();
        assert!(!m.is_incremental());
    }

    #[tokio::test]
    async fn earlier_time_after_or_new_config_forces_full() {
        let store = MemoryStore::new();
        let meta: Arc<dyn MetaStore> = Arc::new(store.clone());
        let policy = SyncPolicy {
            time_after: Some(at(5)),
            ..Default::default()
        };
        let cfg = json!({"issueTypes": ["bug"]});
        CollectorStateManager::load(meta.clone(), &raw(), &policy, Some(&cfg), at(10))
            .await
            .unwrap()
            .close()
            .await
            .unwrap();
        let stored = store
            .get_collector_state("_raw_fixture_api_issues", raw().params_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.time_after, Some(at(5)));

        let earlier = SyncPolicy {
            time_after: Some(at(3)),
            ..Default::default()
        };
        let m = CollectorStateManager::load(meta.clone(), &raw(), &earlier, Some(&cfg), at(11)).await.unwrap();
        assert!(!m.is_incremental());
        assert_eq!(m.since(), Some(at(3)));

        let other = json!({"issueTypes": ["incident"]});
        let m = CollectorStateManager::load(meta.clone(), &raw(), &policy, Some(&other), at(11)).await.unwrap();
        assert!(!m.is_incremental());

        let m = CollectorStateManager::load(meta, &raw(), &policy, Some(&cfg), at(11)).await.unwrap();
        assert!(m.is_incremental());
        assert_eq!(m.since(), Some(at(10)));
    }

    /// Records the `since` query param of every request; fails while `fail` is set.
    fn upstream(seen: Arc<Mutex<Vec<String>>>, fail: Arc<std::sync::atomic::AtomicBool>) -> Router {
        Router::new().route(
            "/issues",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let seen = seen.clone();
                let fail = fail.clone();
                async move {
                    seen.lock().unwrap().push(q.get("since").cloned().unwrap_or_default());
                    if fail.load(std::sync::atomic::Ordering::SeqCst) {
                        return (StatusCode::BAD_REQUEST, "[]".to_string());
                    }
                    (StatusCode::OK, json!([{"id": 1}, {"id": 2}]).to_string())
                }
            }),
        )
    }

    async fn run(ctx: &SubTaskContext, base: &str) -> Result<CollectStats> {
        let mut c = StatefulApiCollector::new(ctx, &raw(), None).await?;
        let since = c.since();
        let client = Arc::new(ApiClient::builder(base).build()?);
        let mut args = ApiCollectorArgs::new(raw(), client, "issues");
        args.query = Some(Box::new(move |_: &RequestData| {
            Ok(since
                .map(|s| vec![("since".to_string(), s.to_rfc3339())])
                .unwrap_or_default())
        }));
        args.paging = Paging::Single;
        args.parse = Box::new(|res: &ApiResponse| Ok(Page::items(res.json()?)));
        c.add(args)?;
        c.execute(ctx).await
    }

    #[tokio::test]
    async fn watermark_advances_only_after_success() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let base = test_support::serve(upstream(seen.clone(), fail.clone())).await;
        let (ctx, store) = test_support::subtask_ctx(json!({})).await;
        let key = ("_raw_fixture_api_issues", raw().params_string().to_string());

        run(&ctx, &base).await.unwrap();
        let first = store.get_collector_state(key.0, &key.1).await.unwrap().unwrap();
        let t1 = first.latest_success_start.unwrap();

        fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(run(&ctx, &base).await.is_err());
        let after_failure = store.get_collector_state(key.0, &key.1).await.unwrap().unwrap();
        assert_eq!(after_failure.latest_success_start, Some(t1));

        fail.store(false, std::sync::atomic::Ordering::SeqCst);
        run(&ctx, &base).await.unwrap();
        let third = store.get_collector_state(key.0, &key.1).await.unwrap().unwrap();
        assert!(third.latest_success_start.unwrap() >= t1);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0], "");
        for s in &seen[1..] {
            let bound = DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
            assert!(bound >= t1);
        }
        // Incremental runs keep earlier rows.
        assert_eq!(store.count_raw(key.0, &key.1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mismatched_raw_table_is_rejected() {
        let (ctx, _store) = test_support::subtask_ctx(json!({})).await;
        let mut c = StatefulApiCollector::new(&ctx, &raw(), None).await.unwrap();
        let other = RawDataArgs::new("fixture", "_api_other", json!({"a": 1})).unwrap();
        let client = Arc::new(ApiClient::builder("http://localhost/").build().unwrap());
        assert!(c.add(ApiCollectorArgs::new(other, client, "x")).is_err());
    }
}
