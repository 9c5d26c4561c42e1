//! Two-phase collection for entities that change until they reach a final
//! state (CI runs, deployments).
//!
//! Phase one lists entities newest first and stops at the first one created
//! before the watermark. Phase two re-fetches the detail of every entity an
//! earlier run saw in a non-final state.

use crate::collector::api_collector::{ApiCollector, ApiCollectorArgs, CollectStats, Page, Paging, QueryFn, ResponseParser};
use crate::collector::client::{AfterResponse, ApiClient, ApiResponse};
use crate::collector::iterator::InputIterator;
use crate::collector::raw::RawDataArgs;
use crate::collector::stateful::CollectorStateManager;
use crate::subtask::context::SubTaskContext;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Reads an item's creation time.
pub type CreatedAtFn = Arc<dyn Fn(&Value) -> Result<DateTime<Utc>> + Send + Sync>;
/// Builds the phase-two inputs once phase one has finished.
pub type BuildInputFn = Box<dyn FnOnce(&SubTaskContext) -> Result<Box<dyn InputIterator>> + Send>;

pub struct FinalizableListArgs {
    pub url_template: String,
    pub query: Option<QueryFn>,
    pub paging: Paging,
    /// Must yield items newest first.
    pub parse: ResponseParser,
    pub created_at: CreatedAtFn,
}

pub struct FinalizableDetailArgs {
    pub url_template: String,
    pub query: Option<QueryFn>,
    pub paging: Paging,
    pub parse: ResponseParser,
    pub build_input: BuildInputFn,
    pub after_response: Option<AfterResponse>,
}

pub struct FinalizableApiCollector {
    raw: RawDataArgs,
    client: Arc<ApiClient>,
    config: Option<Value>,
    list: FinalizableListArgs,
    detail: Option<FinalizableDetailArgs>,
}

/// Drop items created before `after`; finish paging once any were dropped.
fn created_after_filter(parse: ResponseParser, created_at: CreatedAtFn, after: Option<DateTime<Utc>>) -> ResponseParser {
    let Some(after) = after else {
        return parse;
    };
    Box::new(move |res: &ApiResponse| {
        let page = parse(res)?;
        let before = page.items.len();
        let mut items = Vec::with_capacity(before);
        for item in page.items {
            if created_at(&item)? >= after {
                items.push(item);
            }
        }
        let finish = page.finish || items.len() < before;
        Ok(Page { items, finish })
    })
}

impl FinalizableApiCollector {
    pub fn new(
        raw: RawDataArgs,
        client: Arc<ApiClient>,
        list: FinalizableListArgs,
        detail: Option<FinalizableDetailArgs>,
    ) -> Result<Self> {
        if matches!(list.paging, Paging::Undetermined { concurrency: Some(c), .. } if c > 1)
            || matches!(list.paging, Paging::Undetermined { concurrency: None, .. })
        {
            return Err(Error::InvalidInput(
                "finalizable list collection must page in order".to_string(),
            ));
        }
        Ok(Self {
            raw,
            client,
            config: None,
            list,
            detail,
        })
    }

    /// Config whose change forces a full re-collection.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.raw.table()))]
    pub async fn execute(self, ctx: &SubTaskContext) -> Result<CollectStats> {
        let manager = CollectorStateManager::from_context(ctx, &self.raw, self.config.as_ref()).await?;
        let incremental = manager.is_incremental();
        let since = manager.since();

        let mut list = ApiCollectorArgs::new(self.raw.clone(), self.client.clone(), self.list.url_template);
        list.query = self.list.query;
        list.paging = self.list.paging;
        list.parse = created_after_filter(self.list.parse, self.list.created_at, since);
        list.incremental = incremental;
        let mut stats = ApiCollector::new(list)?.execute(ctx).await?;
        tracing::debug!(requests = stats.requests, incremental, "list phase finished");

        match self.detail {
            Some(detail) if !ctx.sync_policy().full_sync => {
                let input = (detail.build_input)(ctx)?;
                let mut args = ApiCollectorArgs::new(self.raw.clone(), self.client.clone(), detail.url_template);
                args.query = detail.query;
                args.paging = detail.paging;
                args.parse = detail.parse;
                args.input = Some(input);
                args.after_response = detail.after_response;
                args.incremental = true;
                stats += ApiCollector::new(args)?.execute(ctx).await?;
            }
            _ => tracing::debug!("detail phase skipped"),
        }

        manager.close().await?;
        Ok(stats)
    }
}
