//! Generic paged collector: renders requests, fetches through the shared
//! client and stages every parsed item as a raw row.

use crate::collector::client::{AfterResponse, ApiClient, ApiResponse, RequestOptions};
use crate::collector::iterator::InputIterator;
use crate::collector::raw::RawDataArgs;
use crate::collector::template::{Pager, RequestData, UrlTemplate};
use crate::storage::traits::NewRawRecord;
use crate::subtask::context::SubTaskContext;
use crate::{Error, Result};
use futures_util::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type QueryFn = Box<dyn Fn(&RequestData) -> Result<Vec<(String, String)>> + Send + Sync>;
pub type ResponseParser = Box<dyn Fn(&ApiResponse) -> Result<Page> + Send + Sync>;
pub type TotalPagesFn = Box<dyn Fn(&ApiResponse, &RequestData) -> Result<u64> + Send + Sync>;
/// Extracts the cursor for the next request; `None` ends paging.
pub type NextPageFn = Box<dyn Fn(&RequestData, &ApiResponse) -> Result<Option<Value>> + Send + Sync>;

/// Items parsed from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    /// Stop paging after saving `items`.
    pub finish: bool,
}

impl Page {
    pub fn items(items: Vec<Value>) -> Self {
        Self { items, finish: false }
    }

    pub fn finish(items: Vec<Value>) -> Self {
        Self { items, finish: true }
    }
}

/// Parser for endpoints that return a bare JSON array.
pub fn json_array_parser() -> ResponseParser {
    Box::new(|res: &ApiResponse| Ok(Page::items(res.json::<Vec<Value>>()?)))
}

/// Parser for endpoints that return the entity itself.
pub fn json_object_parser() -> ResponseParser {
    Box::new(|res: &ApiResponse| Ok(Page::items(vec![res.json::<Value>()?])))
}

pub enum Paging {
    /// One request per input.
    Single,
    /// Total pages are read from the first response; the rest are fetched concurrently.
    Determined {
        page_size: u64,
        total_pages: TotalPagesFn,
        concurrency: usize,
    },
    /// `concurrency` strided page streams, each stopping at its first short page.
    /// Defaults to 2 streams per input, or 10 without inputs.
    Undetermined {
        page_size: u64,
        concurrency: Option<usize>,
    },
    /// Each request depends on a cursor from the previous response.
    Sequential { page_size: u64, next_page: NextPageFn },
}

impl Paging {
    fn page_size(&self) -> u64 {
        match self {
            Paging::Single => 0,
            Paging::Determined { page_size, .. }
            | Paging::Undetermined { page_size, .. }
            | Paging::Sequential { page_size, .. } => *page_size,
        }
    }
}

impl std::fmt::Debug for Paging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Paging::Single => f.write_str("Single"),
            Paging::Determined { page_size, concurrency, .. } => f
                .debug_struct("Determined")
                .field("page_size", page_size)
                .field("concurrency", concurrency)
                .finish(),
            Paging::Undetermined { page_size, concurrency } => f
                .debug_struct("Undetermined")
                .field("page_size", page_size)
                .field("concurrency", concurrency)
                .finish(),
            Paging::Sequential { page_size, .. } => f
                .debug_struct("Sequential")
                .field("page_size", page_size)
                .finish(),
        }
    }
}

pub struct ApiCollectorArgs {
    pub raw: RawDataArgs,
    pub client: Arc<ApiClient>,
    pub url_template: String,
    pub query: Option<QueryFn>,
    pub paging: Paging,
    pub parse: ResponseParser,
    pub input: Option<Box<dyn InputIterator>>,
    /// When false, raw rows for these params are deleted before collecting.
    pub incremental: bool,
    pub request_cost: u32,
    pub after_response: Option<AfterResponse>,
}

impl ApiCollectorArgs {
    pub fn new(raw: RawDataArgs, client: Arc<ApiClient>, url_template: impl Into<String>) -> Self {
        Self {
            raw,
            client,
            url_template: url_template.into(),
            query: None,
            paging: Paging::Single,
            parse: json_array_parser(),
            input: None,
            incremental: false,
            request_cost: 1,
            after_response: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub requests: u64,
    pub records: u64,
}

impl std::ops::AddAssign for CollectStats {
    fn add_assign(&mut self, rhs: Self) {
        self.requests += rhs.requests;
        self.records += rhs.records;
    }
}

struct Fetched {
    count: u64,
    finish: bool,
    response: Option<ApiResponse>,
}

pub struct ApiCollector {
    raw: RawDataArgs,
    client: Arc<ApiClient>,
    template: UrlTemplate,
    query: Option<QueryFn>,
    paging: Paging,
    parse: ResponseParser,
    input: Option<Box<dyn InputIterator>>,
    incremental: bool,
    options: RequestOptions,
    requests: AtomicU64,
    records: AtomicU64,
}

impl ApiCollector {
    pub fn new(args: ApiCollectorArgs) -> Result<Self> {
        let template = UrlTemplate::parse(&args.url_template)?;
        match &args.paging {
            Paging::Single => {}
            Paging::Determined { page_size, concurrency, .. } => {
                if *page_size == 0 || *concurrency == 0 {
                    return Err(Error::InvalidInput(
                        "determined paging needs page_size and concurrency > 0".to_string(),
                    ));
                }
            }
            Paging::Undetermined { page_size, concurrency } => {
                if *page_size == 0 || *concurrency == Some(0) {
                    return Err(Error::InvalidInput(
                        "undetermined paging needs page_size and concurrency > 0".to_string(),
                    ));
                }
            }
            Paging::Sequential { page_size, .. } => {
                if *page_size == 0 {
                    return Err(Error::InvalidInput("sequential paging needs page_size > 0".to_string()));
                }
            }
        }
        Ok(Self {
            raw: args.raw,
            client: args.client,
            template,
            query: args.query,
            paging: args.paging,
            parse: args.parse,
            input: args.input,
            incremental: args.incremental,
            options: RequestOptions {
                cost: args.request_cost,
                after_response: args.after_response,
            },
            requests: AtomicU64::new(0),
            records: AtomicU64::new(0),
        })
    }

    pub fn raw(&self) -> &RawDataArgs {
        &self.raw
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub(crate) fn set_incremental(&mut self, incremental: bool) {
        self.incremental = incremental;
    }

    /// Collect everything, once per input when an input iterator is set.
    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.raw.table(), url = %self.template.as_str()))]
    pub async fn execute(mut self, ctx: &SubTaskContext) -> Result<CollectStats> {
        let records = ctx.records();
        records.ensure_raw_table(self.raw.table()).await?;
        if !self.incremental {
            let deleted = records
                .delete_raw(self.raw.table(), self.raw.params_string())
                .await?;
            tracing::debug!(deleted, "cleared raw rows before full collection");
        }

        match self.input.take() {
            None => self.exec(ctx, None).await?,
            Some(mut input) => {
                let res = async {
                    while let Some(v) = input.next().await? {
                        ctx.check_cancelled()?;
                        self.exec(ctx, Some(v)).await?;
                    }
                    Ok::<(), Error>(())
                }
                .await;
                input.close();
                res?;
            }
        }
        ctx.flush_progress().await;

        let stats = CollectStats {
            requests: self.requests.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
        };
        tracing::info!(requests = stats.requests, records = stats.records, "collection finished");
        Ok(stats)
    }

    async fn exec(&self, ctx: &SubTaskContext, input: Option<Value>) -> Result<()> {
        let size = self.paging.page_size();
        let base = RequestData {
            pager: Pager::first(size),
            params: self.raw.params().clone(),
            input,
            custom: None,
        };

        match &self.paging {
            Paging::Single => {
                self.fetch(ctx, &base).await?;
            }
            Paging::Sequential { next_page, .. } => {
                let mut req = base;
                loop {
                    let out = self.fetch(ctx, &req).await?;
                    let Some(res) = out.response else { break };
                    if out.finish || out.count < size {
                        break;
                    }
                    match next_page(&req, &res)? {
                        Some(cursor) => req.custom = Some(cursor),
                        None => break,
                    }
                    req.pager = Pager::at(req.pager.page + 1, size);
                }
            }
            Paging::Determined {
                total_pages,
                concurrency,
                ..
            } => {
                let first = self.fetch(ctx, &base).await?;
                let Some(res) = first.response else {
                    return Ok(());
                };
                if first.finish {
                    return Ok(());
                }
                let total = total_pages(&res, &base)?;
                if base.input.is_none() {
                    ctx.set_progress(1, Some(total)).await;
                }
                let base = &base;
                stream::iter(2..=total)
                    .map(|page| async move {
                        let mut req = base.clone();
                        req.pager = Pager::at(page, size);
                        self.fetch(ctx, &req).await.map(|_| ())
                    })
                    .buffer_unordered(*concurrency)
                    .try_collect::<Vec<()>>()
                    .await?;
            }
            Paging::Undetermined { concurrency, .. } => {
                let streams = concurrency
                    .unwrap_or(if base.input.is_some() { 2 } else { 10 })
                    .max(1) as u64;
                let base = &base;
                let lanes = (0..streams).map(|lane| async move {
                    let mut page = lane + 1;
                    loop {
                        let mut req = base.clone();
                        req.pager = Pager::at(page, size);
                        let out = self.fetch(ctx, &req).await?;
                        if out.finish || out.count < size {
                            return Ok::<(), Error>(());
                        }
                        page += streams;
                    }
                });
                futures_util::future::try_join_all(lanes).await?;
            }
        }
        Ok(())
    }

    async fn fetch(&self, ctx: &SubTaskContext, req: &RequestData) -> Result<Fetched> {
        ctx.check_cancelled()?;
        let url = self.template.render(req)?;
        let query = match &self.query {
            Some(q) => q(req)?,
            None => Vec::new(),
        };
        self.requests.fetch_add(1, Ordering::Relaxed);
        let res = self
            .client
            .get(&url, &query, &self.options, ctx.cancel_token())
            .await?;
        let Some(res) = res else {
            ctx.inc_progress(1).await;
            return Ok(Fetched {
                count: 0,
                finish: false,
                response: None,
            });
        };

        let page = (self.parse)(&res)?;
        let count = page.items.len() as u64;
        if count > 0 {
            let rows: Vec<NewRawRecord> = page
                .items
                .into_iter()
                .map(|data| NewRawRecord {
                    data,
                    url: res.url.clone(),
                    input: req.input.clone(),
                })
                .collect();
            let inserted = ctx
                .records()
                .insert_raw(self.raw.table(), self.raw.params_string(), &rows)
                .await?;
            self.records.fetch_add(inserted, Ordering::Relaxed);
        }
        ctx.inc_progress(1).await;
        Ok(Fetched {
            count,
            finish: page.finish,
            response: Some(res),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::iterator::VecInput;
    use crate::storage::traits::RecordStore;
    use crate::test_support;
    use axum::Json;
    use axum::Router;
    use axum::extract::{Path, Query};
    use axum::routing::get;
    use serde_json::json;
    use std::collections::HashMap;

    /// 23 items served 5 per page; `/items` also reports the total page count.
    fn upstream() -> Router {
        async fn items(Query(q): Query<HashMap<String, u64>>) -> Json<Value> {
            let page = q.get("page").copied().unwrap_or(1);
            let size = q.get("per_page").copied().unwrap_or(5);
            let start = (page - 1) * size;
            let data: Vec<Value> = (start..(start + size).min(23)).map(|i| json!({"id": i})).collect();
            Json(json!({"total_pages": 23u64.div_ceil(size), "items": data}))
        }
        async fn children(Path(parent): Path<u64>) -> Json<Value> {
            Json(json!([{"parent": parent, "n": 1}, {"parent": parent, "n": 2}]))
        }
        Router::new()
            .route("/items", get(items))
            .route("/parents/{id}/children", get(children))
    }

    fn paged_query() -> QueryFn {
        Box::new(|r: &RequestData| {
            Ok(vec![
                ("page".to_string(), r.pager.page.to_string()),
                ("per_page".to_string(), r.pager.size.to_string()),
            ])
        })
    }

    fn items_parser() -> ResponseParser {
        Box::new(|res: &ApiResponse| {
            let body: Value = res.json()?;
            Ok(Page::items(body["items"].as_array().cloned().unwrap_or_default()))
        })
    }

    async fn args(paging: Paging) -> (ApiCollectorArgs, SubTaskContext, crate::storage::MemoryStore) {
        let base = test_support::serve(upstream()).await;
        let (ctx, store) = test_support::subtask_ctx(json!({})).await;
        let raw = RawDataArgs::new("fixture", "_api_items", json!({"ConnectionId": 1, "Name": "a"})).unwrap();
        let client = Arc::new(ApiClient::builder(base).build().unwrap());
        let mut a = ApiCollectorArgs::new(raw, client, "items");
        a.query = Some(paged_query());
        a.parse = items_parser();
        a.paging = paging;
        (a, ctx, store)
    }

    #[tokio::test]
    async fn undetermined_paging_collects_every_item_once() {
        let (a, ctx, store) = args(Paging::Undetermined {
            page_size: 5,
            concurrency: Some(3),
        })
        .await;
        let stats = ApiCollector::new(a).unwrap().execute(&ctx).await.unwrap();
        assert_eq!(stats.records, 23);
        let count = store
            .count_raw("_raw_fixture_api_items", r#"{"ConnectionId":1,"Name":"a"}"#)
            .await
            .unwrap();
        assert_eq!(count, 23);
    }

    #[tokio::test]
    async fn determined_paging_uses_total_from_first_page() {
        let (a, ctx, store) = args(Paging::Determined {
            page_size: 5,
            total_pages: Box::new(|res: &ApiResponse, _: &RequestData| {
                let body: Value = res.json()?;
                Ok(body["total_pages"].as_u64().unwrap_or(1))
            }),
            concurrency: 2,
        })
        .await;
        let stats = ApiCollector::new(a).unwrap().execute(&ctx).await.unwrap();
        assert_eq!(stats.requests, 5);
        assert_eq!(stats.records, 23);

        // Re-staging an already collected payload is a no-op.
        let inserted = store
            .insert_raw(
                "_raw_fixture_api_items",
                r#"{"ConnectionId":1,"Name":"a"}"#,
                &[NewRawRecord {
                    data: json!({"id": 0}),
                    url: "elsewhere".into(),
                    input: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 0);
    }

    #[tokio::test]
    async fn sequential_paging_stops_on_finish_signal() {
        let (mut a, ctx, _store) = args(Paging::Sequential {
            page_size: 5,
            next_page: Box::new(|req: &RequestData, _: &ApiResponse| Ok(Some(json!(req.pager.page + 1)))),
        })
        .await;
        a.parse = Box::new(|res: &ApiResponse| {
            let body: Value = res.json()?;
            let items = body["items"].as_array().cloned().unwrap_or_default();
            let stop = items.iter().any(|i| i["id"] == 7);
            Ok(Page { items, finish: stop })
        });
        let stats = ApiCollector::new(a).unwrap().execute(&ctx).await.unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.records, 10);
    }

    #[tokio::test]
    async fn single_requests_run_once_per_input() {
        let (mut a, ctx, store) = args(Paging::Single).await;
        a.url_template = "parents/{Input.id}/children".into();
        a.query = None;
        a.parse = json_array_parser();
        a.input = Some(Box::new(VecInput::new(vec![json!({"id": 1}), json!({"id": 2})])));
        let stats = ApiCollector::new(a).unwrap().execute(&ctx).await.unwrap();
        assert_eq!(stats.requests, 2);
        let raws = store
            .fetch_raw("_raw_fixture_api_items", r#"{"ConnectionId":1,"Name":"a"}"#, 0, 10)
            .await
            .unwrap();
        assert_eq!(raws.len(), 4);
        assert_eq!(raws[0].input, Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn full_collection_replaces_previous_rows() {
        let (mut a, ctx, store) = args(Paging::Single).await;
        a.query = None;
        let table = "_raw_fixture_api_items";
        let params = a.raw.params_string().to_string();
        store.ensure_raw_table(table).await.unwrap();
        store
            .insert_raw(
                table,
                &params,
                &[NewRawRecord {
                    data: json!({"stale": true}),
                    url: "old".into(),
                    input: None,
                }],
            )
            .await
            .unwrap();
        ApiCollector::new(a).unwrap().execute(&ctx).await.unwrap();
        let raws = store.fetch_raw(table, &params, 0, 100).await.unwrap();
        assert!(raws.iter().all(|r| r.data.get("stale").is_none()));
        assert_eq!(raws.len(), 5);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let raw = RawDataArgs::new("fixture", "_api_items", json!({"a": 1})).unwrap();
        let client = Arc::new(ApiClient::builder("http://localhost/").build().unwrap());
        let mut a = ApiCollectorArgs::new(raw, client, "items");
        a.paging = Paging::Undetermined {
            page_size: 0,
            concurrency: None,
        };
        assert!(matches!(ApiCollector::new(a), Err(Error::InvalidInput(_))));
    }
}
