//! Collect, extract and convert subtasks for issues and workflow runs.

use super::GithubTaskData;
use super::models::{
    ApiIssue, ApiRun, ApiRunsPage, GithubIssue, GithubRun, RAW_ISSUES_SUFFIX, RAW_REPOS_SUFFIX, RAW_RUNS_SUFFIX,
    TOOL_ISSUES_TABLE, TOOL_RUNS_TABLE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;
use tributary_core::collector::api_collector::json_object_parser;
use tributary_core::collector::client::{ApiResponse, ignore_not_found};
use tributary_core::collector::{
    ApiCollectorArgs, FinalizableApiCollector, FinalizableDetailArgs, FinalizableListArgs, InputIterator, Page,
    Paging, RecordInput, RequestData, StatefulApiCollector,
};
use tributary_core::domain::models::{
    CICD_PIPELINES_TABLE, CicdPipeline, ISSUES_TABLE, Issue, IssueStatus, REPOS_TABLE, Repo,
};
use tributary_core::domain::{
    CicdResult, CicdStatus, DomainIdGenerator, ResultRule, StatusRule, classify_result, classify_status,
};
use tributary_core::models::ConnectionId;
use tributary_core::storage::{RawRecord, Record, RecordCursor};
use tributary_core::subtask::{ApiExtractor, DataConverter, OutputRow, SubTask, SubTaskContext};
use tributary_core::{Error, Result};

const PAGE_SIZE: u64 = 100;

const RUN_RESULT: ResultRule<'static> = ResultRule {
    success: &["success"],
    failure: &["failure", "cancelled", "timed_out", "startup_failure", "action_required"],
    default: CicdResult::Default,
};

const RUN_STATUS: StatusRule<'static> = StatusRule {
    done: &["completed"],
    in_progress: &["in_progress", "queued", "requested", "waiting", "pending"],
    default: CicdStatus::Other,
};

fn pager_query(req: &RequestData) -> Vec<(String, String)> {
    vec![
        ("page".to_string(), req.pager.page.to_string()),
        ("per_page".to_string(), req.pager.size.to_string()),
    ]
}

fn time_field(item: &Value, field: &str) -> Result<DateTime<Utc>> {
    let s = item
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::BackendMessage(format!("github item has no {field}")))?;
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::backend(format!("parse github {field}"), e))
}

fn decode<T: serde::de::DeserializeOwned>(v: &Value, what: &str) -> Result<T> {
    serde_json::from_value(v.clone()).map_err(|e| Error::backend(format!("decode github {what}"), e))
}

/// The repository row every issue and run points at, derived from the scope.
pub struct ConvertRepo;

#[async_trait]
impl SubTask for ConvertRepo {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_REPOS_SUFFIX)?;
        let repo_ids = DomainIdGenerator::new("github", "GithubRepo");
        let repo = Repo {
            id: repo_ids.generate(ConnectionId(data.options.connection_id), &data.options.name),
            name: data.options.name.clone(),
            url: format!("https://github.com/{}", data.options.name),
            description: None,
            created_date: None,
        };
        let record = Record {
            key: repo.id.clone(),
            data: serde_json::to_value(&repo).map_err(|e| Error::backend("encode repo", e))?,
            origin: raw.origin(0),
        };
        ctx.records().ensure_record_table(REPOS_TABLE).await?;
        ctx.records().upsert_records(REPOS_TABLE, &[record]).await?;
        Ok(())
    }
}

/// Issues updated since the last successful collection.
pub struct CollectIssues;

#[async_trait]
impl SubTask for CollectIssues {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_ISSUES_SUFFIX)?;
        let mut collector = StatefulApiCollector::new(ctx, &raw, None).await?;
        let since = collector.since();

        let mut args = ApiCollectorArgs::new(raw, data.client.clone(), "repos/{Params.Name}/issues");
        args.query = Some(Box::new(move |req: &RequestData| {
            let mut q = pager_query(req);
            q.push(("state".to_string(), "all".to_string()));
            q.push(("sort".to_string(), "updated".to_string()));
            q.push(("direction".to_string(), "asc".to_string()));
            if let Some(since) = since {
                q.push(("since".to_string(), since.to_rfc3339()));
            }
            Ok(q)
        }));
        args.paging = Paging::Undetermined {
            page_size: PAGE_SIZE,
            concurrency: None,
        };
        collector.add(args)?;
        let stats = collector.execute(ctx).await?;
        tracing::info!(repo = %data.options.name, requests = stats.requests, records = stats.records, "issues collected");
        Ok(())
    }
}

pub struct ExtractIssues;

#[async_trait]
impl SubTask for ExtractIssues {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_ISSUES_SUFFIX)?;
        let connection_id = data.options.connection_id;
        let repo = data.options.name.clone();
        let extracted = ApiExtractor::new(
            raw,
            Box::new(move |r: &RawRecord| {
                let issue: ApiIssue = decode(&r.data, "issue")?;
                // pull requests are listed by the issues endpoint too
                if issue.pull_request.is_some() {
                    return Ok(vec![]);
                }
                let row = GithubIssue::from_api(connection_id, &repo, issue);
                Ok(vec![OutputRow::new(TOOL_ISSUES_TABLE, row.key(), &row)?])
            }),
        )
        .tables(&[TOOL_ISSUES_TABLE])
        .execute(ctx)
        .await?;
        tracing::debug!(extracted, "issues extracted");
        Ok(())
    }
}

pub struct ConvertIssues;

pub(crate) fn issue_status(state: &str) -> IssueStatus {
    match state {
        "closed" => IssueStatus::Done,
        _ => IssueStatus::Todo,
    }
}

#[async_trait]
impl SubTask for ConvertIssues {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_ISSUES_SUFFIX)?;
        let issue_ids = DomainIdGenerator::new("github", "GithubIssue");
        let repo_ids = DomainIdGenerator::new("github", "GithubRepo");
        let scope_id = repo_ids.generate(ConnectionId(data.options.connection_id), &data.options.name);
        let converted = DataConverter::new(
            raw,
            TOOL_ISSUES_TABLE,
            Box::new(move |rec: &Record| {
                let i: GithubIssue = decode(&rec.data, "tool issue")?;
                let issue = Issue {
                    id: issue_ids.generate(ConnectionId(i.connection_id), i.github_id),
                    url: i.url,
                    issue_key: i.number.to_string(),
                    title: i.title,
                    description: i.body,
                    issue_type: "ISSUE".to_string(),
                    status: issue_status(&i.state),
                    original_status: i.state,
                    created_date: i.created_at,
                    updated_date: Some(i.updated_at),
                    resolution_date: i.closed_at,
                    lead_time_minutes: Issue::lead_time(i.created_at, i.closed_at),
                    creator_name: i.author,
                    assignee_name: i.assignee,
                    scope_id: scope_id.clone(),
                };
                Ok(vec![OutputRow::new(ISSUES_TABLE, issue.id.clone(), &issue)?])
            }),
        )?
        .tables(&[ISSUES_TABLE])
        .execute(ctx)
        .await?;
        tracing::debug!(converted, "issues converted");
        Ok(())
    }
}

/// New runs newest first down to the watermark, then every run a previous
/// collection saw unfinished.
pub struct CollectRuns;

fn unfinished_run(rec: &Record) -> Option<Value> {
    let run: GithubRun = serde_json::from_value(rec.data.clone()).ok()?;
    (!run.is_finished()).then(|| json!({"id": run.id}))
}

#[async_trait]
impl SubTask for CollectRuns {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_RUNS_SUFFIX)?;
        ctx.records().ensure_record_table(TOOL_RUNS_TABLE).await?;

        let list = FinalizableListArgs {
            url_template: "repos/{Params.Name}/actions/runs".to_string(),
            query: Some(Box::new(|req: &RequestData| Ok(pager_query(req)))),
            paging: Paging::Undetermined {
                page_size: PAGE_SIZE,
                concurrency: Some(1),
            },
            parse: Box::new(|res: &ApiResponse| {
                let page: ApiRunsPage = res.json()?;
                Ok(Page::items(page.workflow_runs))
            }),
            created_at: Arc::new(|item: &Value| time_field(item, "created_at")),
        };

        let records = ctx.records().clone();
        let filter = raw.filter();
        let detail = FinalizableDetailArgs {
            url_template: "repos/{Params.Name}/actions/runs/{Input.id}".to_string(),
            query: None,
            paging: Paging::Single,
            parse: json_object_parser(),
            build_input: Box::new(move |_ctx: &SubTaskContext| {
                let cursor = RecordCursor::new(records, TOOL_RUNS_TABLE, filter);
                Ok(Box::new(RecordInput::new(cursor, unfinished_run)) as Box<dyn InputIterator>)
            }),
            after_response: Some(ignore_not_found()),
        };

        let stats = FinalizableApiCollector::new(raw, data.client.clone(), list, Some(detail))?
            .execute(ctx)
            .await?;
        tracing::info!(repo = %data.options.name, requests = stats.requests, records = stats.records, "runs collected");
        Ok(())
    }
}

pub struct ExtractRuns;

#[async_trait]
impl SubTask for ExtractRuns {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_RUNS_SUFFIX)?;
        let connection_id = data.options.connection_id;
        let repo = data.options.name.clone();
        let extracted = ApiExtractor::new(
            raw,
            Box::new(move |r: &RawRecord| {
                let run: ApiRun = decode(&r.data, "run")?;
                let row = GithubRun::from_api(connection_id, &repo, run);
                Ok(vec![OutputRow::new(TOOL_RUNS_TABLE, row.key(), &row)?])
            }),
        )
        .tables(&[TOOL_RUNS_TABLE])
        .execute(ctx)
        .await?;
        tracing::debug!(extracted, "runs extracted");
        Ok(())
    }
}

pub struct ConvertRuns;

#[async_trait]
impl SubTask for ConvertRuns {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()> {
        let data = ctx.data::<GithubTaskData>()?;
        let raw = data.raw_args(RAW_RUNS_SUFFIX)?;
        let run_ids = DomainIdGenerator::new("github", "GithubRun");
        let repo_ids = DomainIdGenerator::new("github", "GithubRepo");
        let scope_id = repo_ids.generate(ConnectionId(data.options.connection_id), &data.options.name);
        let production = data.options.scope_config.production_branch.clone();
        let converted = DataConverter::new(
            raw,
            TOOL_RUNS_TABLE,
            Box::new(move |rec: &Record| {
                let run: GithubRun = decode(&rec.data, "tool run")?;
                let status = classify_status(&RUN_STATUS, &run.status);
                let original_result = run.conclusion.clone().unwrap_or_default();
                let result = if status == CicdStatus::Done {
                    classify_result(&RUN_RESULT, &original_result)
                } else {
                    CicdResult::Default
                };
                let started = run.run_started_at.unwrap_or(run.created_at);
                let finished_date = (status == CicdStatus::Done).then_some(run.updated_at);
                let environment = match (&production, &run.head_branch) {
                    (Some(p), Some(b)) if p == b => Some("PRODUCTION".to_string()),
                    _ => None,
                };
                let pipeline = CicdPipeline {
                    id: run_ids.generate(ConnectionId(run.connection_id), run.id),
                    name: run.name,
                    result,
                    status,
                    original_result,
                    original_status: run.status,
                    created_date: run.created_at,
                    finished_date,
                    duration_sec: finished_date.map(|f| (f - started).num_seconds().max(0)),
                    cicd_scope_id: scope_id.clone(),
                    environment,
                };
                Ok(vec![OutputRow::new(CICD_PIPELINES_TABLE, pipeline.id.clone(), &pipeline)?])
            }),
        )?
        .tables(&[CICD_PIPELINES_TABLE])
        .execute(ctx)
        .await?;
        tracing::debug!(converted, "runs converted");
        Ok(())
    }
}
