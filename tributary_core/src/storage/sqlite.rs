//! SQLite-backed storage for engine metadata and collected records.
//!
//! Single WAL-mode file. Raw and record tables are created on demand and
//! registered in `_tributary_tables` so scope purges can find them.
//!
//! Usage:
//! ```ignore
//! let store = SqliteStore::new(".tributary/tributary.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::blueprints::models::{Blueprint, BlueprintMode, BlueprintQuery};
use crate::collector::stateful::CollectorState;
use crate::domain::lineage::{
    RAW_TABLE_PREFIX, RawDataOrigin, TableKind, raw_table_prefix, table_kind, validate_table_name,
};
use crate::error::{Error as CoreError, Result as CoreResult};
use crate::models::{BlueprintId, ConnectionId, PipelineId, ScopeConfigId, Status, TaskId};
use crate::pipelines::models::{
    NewPipeline, NewTask, Pipeline, PipelineQuery, SubTaskRecord, Task, TaskProgress,
    spent_seconds,
};
use crate::sources::models::{Connection, PurgeReport, Scope, ScopeConfig};
use crate::storage::traits::{
    MetaStore, NewRawRecord, RawRecord, Record, RecordFilter, RecordStore, ScopePurge,
};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;

/// Durable store backed by a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create (or open) the store at `path`, creating parent directories and
    /// running the schema migration.
    pub async fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::backend("sqlite_store", e))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| CoreError::backend("sqlite_store", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::backend("sqlite_store", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CoreError::backend("sqlite_store_migration", e))?;

        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _tributary_pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    blueprint_id INTEGER,
    plan TEXT NOT NULL,
    status TEXT NOT NULL,
    total_tasks INTEGER NOT NULL,
    finished_tasks INTEGER NOT NULL DEFAULT 0,
    labels TEXT NOT NULL,
    sync_policy TEXT NOT NULL,
    message TEXT,
    error_name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    began_at TEXT,
    finished_at TEXT,
    spent_seconds INTEGER
);

CREATE INDEX IF NOT EXISTS _tributary_pipelines_status_idx ON _tributary_pipelines(status);
CREATE INDEX IF NOT EXISTS _tributary_pipelines_blueprint_idx ON _tributary_pipelines(blueprint_id);

CREATE TABLE IF NOT EXISTS _tributary_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id INTEGER NOT NULL,
    pipeline_row INTEGER NOT NULL,
    pipeline_col INTEGER NOT NULL,
    plugin TEXT NOT NULL,
    subtasks TEXT NOT NULL,
    options TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT,
    error_name TEXT,
    failed_sub_task TEXT,
    progress TEXT NOT NULL,
    created_at TEXT NOT NULL,
    began_at TEXT,
    finished_at TEXT,
    spent_seconds INTEGER
);

CREATE INDEX IF NOT EXISTS _tributary_tasks_pipeline_idx ON _tributary_tasks(pipeline_id);

CREATE TABLE IF NOT EXISTS _tributary_subtasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    number INTEGER NOT NULL,
    began_at TEXT NOT NULL,
    finished_at TEXT,
    spent_seconds INTEGER,
    is_failed INTEGER NOT NULL,
    message TEXT
);

CREATE INDEX IF NOT EXISTS _tributary_subtasks_task_idx ON _tributary_subtasks(task_id);

CREATE TABLE IF NOT EXISTS _tributary_blueprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    project_name TEXT UNIQUE,
    mode TEXT NOT NULL,
    enable INTEGER NOT NULL,
    is_manual INTEGER NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _tributary_connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plugin TEXT NOT NULL,
    name TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    token TEXT,
    proxy TEXT,
    rate_limit_per_hour INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _tributary_scopes (
    plugin TEXT NOT NULL,
    connection_id INTEGER NOT NULL,
    scope_id TEXT NOT NULL,
    name TEXT NOT NULL,
    full_name TEXT,
    scope_config_id INTEGER,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (plugin, connection_id, scope_id)
);

CREATE TABLE IF NOT EXISTS _tributary_scope_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plugin TEXT NOT NULL,
    connection_id INTEGER,
    name TEXT NOT NULL,
    entities TEXT NOT NULL,
    settings TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS _tributary_collector_states (
    raw_data_table TEXT NOT NULL,
    raw_data_params TEXT NOT NULL,
    latest_success_start TEXT,
    time_after TEXT,
    prev_config TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (raw_data_table, raw_data_params)
);

CREATE TABLE IF NOT EXISTS _tributary_tables (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL
);
"#;

// ── Helpers ─────────────────────────────────────────────────────

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::backend("sqlite_store", e)
}

fn parse_dt(s: &str) -> CoreResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| CoreError::BackendMessage(format!("corrupt timestamp {s:?}: {e}")))
}

fn parse_opt_dt(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn to_json<T: Serialize>(v: &T) -> CoreResult<String> {
    serde_json::to_string(v).map_err(|e| CoreError::backend("sqlite_store_encode", e))
}

fn from_json<T: DeserializeOwned>(s: &str) -> CoreResult<T> {
    serde_json::from_str(s).map_err(|e| CoreError::backend("sqlite_store_decode", e))
}

fn parse_status(s: &str) -> CoreResult<Status> {
    Status::from_str(s).map_err(|e| CoreError::BackendMessage(e.to_string()))
}

/// `LIKE` pattern matching names that start with `prefix` literally.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

async fn register_table(pool: &SqlitePool, name: &str, kind: &str) -> CoreResult<()> {
    sqlx::query("INSERT OR IGNORE INTO _tributary_tables (name, kind) VALUES (?1, ?2)")
        .bind(name)
        .bind(kind)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn insert_tasks(
    tx: &mut Transaction<'_, Sqlite>,
    pipeline_id: PipelineId,
    tasks: &[NewTask],
    now: DateTime<Utc>,
) -> CoreResult<Vec<Task>> {
    let mut created = Vec::with_capacity(tasks.len());
    let progress = TaskProgress::default();
    let progress_json = to_json(&progress)?;
    for t in tasks {
        let res = sqlx::query(
            "INSERT INTO _tributary_tasks (pipeline_id, pipeline_row, pipeline_col, plugin, subtasks, options, status, progress, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(pipeline_id.0 as i64)
        .bind(t.pipeline_row as i64)
        .bind(t.pipeline_col as i64)
        .bind(&t.plugin)
        .bind(to_json(&t.subtasks)?)
        .bind(to_json(&t.options)?)
        .bind(t.status.as_str())
        .bind(&progress_json)
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        created.push(Task {
            id: TaskId(res.last_insert_rowid() as u64),
            pipeline_id,
            pipeline_row: t.pipeline_row,
            pipeline_col: t.pipeline_col,
            plugin: t.plugin.clone(),
            subtasks: t.subtasks.clone(),
            options: t.options.clone(),
            status: t.status,
            message: None,
            error_name: None,
            failed_sub_task: None,
            progress: progress.clone(),
            created_at: now,
            began_at: None,
            finished_at: None,
            spent_seconds: None,
        });
    }
    Ok(created)
}

const PIPELINE_COLUMNS: &str = "id, name, blueprint_id, plan, status, total_tasks, finished_tasks, labels, sync_policy, message, error_name, created_at, updated_at, began_at, finished_at, spent_seconds";

const TASK_COLUMNS: &str = "id, pipeline_id, pipeline_row, pipeline_col, plugin, subtasks, options, status, message, error_name, failed_sub_task, progress, created_at, began_at, finished_at, spent_seconds";

// ── MetaStore impl ─────────────────────────────────────────────

#[async_trait]
impl MetaStore for SqliteStore {
    async fn create_pipeline(&self, new: &NewPipeline, tasks: &[NewTask]) -> CoreResult<(Pipeline, Vec<Task>)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query(
            "INSERT INTO _tributary_pipelines (name, blueprint_id, plan, status, total_tasks, labels, sync_policy, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        )
        .bind(&new.name)
        .bind(new.blueprint_id.map(|b| b.0 as i64))
        .bind(to_json(&new.plan)?)
        .bind(Status::Created.as_str())
        .bind(tasks.len() as i64)
        .bind(to_json(&new.labels)?)
        .bind(to_json(&new.sync_policy)?)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let id = PipelineId(res.last_insert_rowid() as u64);
        let created = insert_tasks(&mut tx, id, tasks, now).await?;
        tx.commit().await.map_err(db_err)?;

        let pipeline = Pipeline {
            id,
            name: new.name.clone(),
            blueprint_id: new.blueprint_id,
            plan: new.plan.clone(),
            status: Status::Created,
            total_tasks: tasks.len() as u64,
            finished_tasks: 0,
            labels: new.labels.clone(),
            sync_policy: new.sync_policy.clone(),
            message: None,
            error_name: None,
            created_at: now,
            updated_at: now,
            began_at: None,
            finished_at: None,
            spent_seconds: None,
        };
        Ok((pipeline, created))
    }

    async fn get_pipeline(&self, id: PipelineId) -> CoreResult<Option<Pipeline>> {
        let row = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM _tributary_pipelines WHERE id = ?1"
        ))
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_pipeline(&r)).transpose()
    }

    async fn list_pipelines(&self, query: &PipelineQuery) -> CoreResult<(Vec<Pipeline>, u64)> {
        let mut clauses: Vec<String> = Vec::new();
        if !query.statuses.is_empty() {
            let marks = vec!["?"; query.statuses.len()].join(", ");
            clauses.push(format!("status IN ({marks})"));
        }
        if query.blueprint_id.is_some() {
            clauses.push("blueprint_id = ?".to_string());
        }
        if query.label.is_some() {
            clauses.push("EXISTS (SELECT 1 FROM json_each(labels) WHERE json_each.value = ?)".to_string());
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order = if query.ascending { "ASC" } else { "DESC" };

        let count_sql = format!("SELECT COUNT(*) AS n FROM _tributary_pipelines {where_sql}");
        let list_sql = format!(
            "SELECT {PIPELINE_COLUMNS} FROM _tributary_pipelines {where_sql} ORDER BY id {order} LIMIT ? OFFSET ?"
        );

        let mut count_q = sqlx::query(&count_sql);
        let mut list_q = sqlx::query(&list_sql);
        for s in &query.statuses {
            count_q = count_q.bind(s.as_str());
            list_q = list_q.bind(s.as_str());
        }
        if let Some(b) = query.blueprint_id {
            count_q = count_q.bind(b.0 as i64);
            list_q = list_q.bind(b.0 as i64);
        }
        if let Some(l) = &query.label {
            count_q = count_q.bind(l.clone());
            list_q = list_q.bind(l.clone());
        }
        list_q = list_q
            .bind(query.pagination.limit() as i64)
            .bind(query.pagination.offset() as i64);

        let n: i64 = count_q
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get("n");
        let rows = list_q.fetch_all(&self.pool).await.map_err(db_err)?;
        let items = rows.iter().map(row_to_pipeline).collect::<CoreResult<Vec<_>>>()?;
        Ok((items, n as u64))
    }

    async fn update_pipeline(&self, p: &Pipeline) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE _tributary_pipelines SET
               name = ?2, status = ?3, total_tasks = ?4, finished_tasks = ?5, labels = ?6,
               sync_policy = ?7, message = ?8, error_name = ?9, updated_at = ?10,
               began_at = ?11, finished_at = ?12, spent_seconds = ?13
             WHERE id = ?1",
        )
        .bind(p.id.0 as i64)
        .bind(&p.name)
        .bind(p.status.as_str())
        .bind(p.total_tasks as i64)
        .bind(p.finished_tasks as i64)
        .bind(to_json(&p.labels)?)
        .bind(to_json(&p.sync_policy)?)
        .bind(&p.message)
        .bind(&p.error_name)
        .bind(Utc::now().to_rfc3339())
        .bind(p.began_at.map(|d| d.to_rfc3339()))
        .bind(p.finished_at.map(|d| d.to_rfc3339()))
        .bind(p.spent_seconds)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("pipeline {}", p.id)));
        }
        Ok(())
    }

    async fn count_pipelines(&self, statuses: &[Status]) -> CoreResult<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let marks = vec!["?"; statuses.len()].join(", ");
        let sql = format!("SELECT COUNT(*) AS n FROM _tributary_pipelines WHERE status IN ({marks})");
        let mut q = sqlx::query(&sql);
        for s in statuses {
            q = q.bind(s.as_str());
        }
        let n: i64 = q.fetch_one(&self.pool).await.map_err(db_err)?.get("n");
        Ok(n as u64)
    }

    async fn fail_interrupted(&self, message: &str, now: DateTime<Utc>) -> CoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let pipelines = sqlx::query("SELECT id, began_at FROM _tributary_pipelines WHERE status = 'RUNNING'")
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        for r in &pipelines {
            let id: i64 = r.get("id");
            let began = parse_opt_dt(r.get("began_at"))?;
            sqlx::query(
                "UPDATE _tributary_pipelines SET status = 'FAILED', message = ?2, finished_at = ?3, spent_seconds = ?4, updated_at = ?3
                 WHERE id = ?1",
            )
            .bind(id)
            .bind(message)
            .bind(now.to_rfc3339())
            .bind(spent_seconds(began, now))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        let tasks = sqlx::query("SELECT id, began_at FROM _tributary_tasks WHERE status = 'RUNNING'")
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        for r in &tasks {
            let id: i64 = r.get("id");
            let began = parse_opt_dt(r.get("began_at"))?;
            sqlx::query(
                "UPDATE _tributary_tasks SET status = 'FAILED', message = ?2, finished_at = ?3, spent_seconds = ?4
                 WHERE id = ?1",
            )
            .bind(id)
            .bind(message)
            .bind(now.to_rfc3339())
            .bind(spent_seconds(began, now))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(pipelines.len() as u64)
    }

    async fn insert_rerun_tasks(&self, pipeline_id: PipelineId, tasks: &[NewTask]) -> CoreResult<Vec<Task>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query(
            "UPDATE _tributary_pipelines SET status = ?2, message = NULL, error_name = NULL, finished_at = NULL, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(pipeline_id.0 as i64)
        .bind(Status::Rerun.as_str())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("pipeline {pipeline_id}")));
        }
        let created = insert_tasks(&mut tx, pipeline_id, tasks, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    async fn get_task(&self, id: TaskId) -> CoreResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM _tributary_tasks WHERE id = ?1"))
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    async fn list_tasks(&self, pipeline_id: PipelineId) -> CoreResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM _tributary_tasks WHERE pipeline_id = ?1 ORDER BY id"
        ))
        .bind(pipeline_id.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn update_task(&self, t: &Task) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE _tributary_tasks SET
               status = ?2, message = ?3, error_name = ?4, failed_sub_task = ?5, progress = ?6,
               began_at = ?7, finished_at = ?8, spent_seconds = ?9
             WHERE id = ?1",
        )
        .bind(t.id.0 as i64)
        .bind(t.status.as_str())
        .bind(&t.message)
        .bind(&t.error_name)
        .bind(&t.failed_sub_task)
        .bind(to_json(&t.progress)?)
        .bind(t.began_at.map(|d| d.to_rfc3339()))
        .bind(t.finished_at.map(|d| d.to_rfc3339()))
        .bind(t.spent_seconds)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("task {}", t.id)));
        }
        Ok(())
    }

    async fn update_task_progress(&self, id: TaskId, progress: &TaskProgress) -> CoreResult<()> {
        sqlx::query("UPDATE _tributary_tasks SET progress = ?2 WHERE id = ?1")
            .bind(id.0 as i64)
            .bind(to_json(progress)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_subtask_record(&self, r: &SubTaskRecord) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO _tributary_subtasks (task_id, name, number, began_at, finished_at, spent_seconds, is_failed, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(r.task_id.0 as i64)
        .bind(&r.name)
        .bind(r.number as i64)
        .bind(r.began_at.to_rfc3339())
        .bind(r.finished_at.map(|d| d.to_rfc3339()))
        .bind(r.spent_seconds)
        .bind(r.is_failed as i64)
        .bind(&r.message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_subtask_records(&self, task_id: TaskId) -> CoreResult<Vec<SubTaskRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, name, number, began_at, finished_at, spent_seconds, is_failed, message
             FROM _tributary_subtasks WHERE task_id = ?1 ORDER BY id",
        )
        .bind(task_id.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| -> CoreResult<SubTaskRecord> {
                let task_id: i64 = r.get("task_id");
                let number: i64 = r.get("number");
                let began_at: String = r.get("began_at");
                let is_failed: i64 = r.get("is_failed");
                Ok(SubTaskRecord {
                    task_id: TaskId(task_id as u64),
                    name: r.get("name"),
                    number: number as u32,
                    began_at: parse_dt(&began_at)?,
                    finished_at: parse_opt_dt(r.get("finished_at"))?,
                    spent_seconds: r.get("spent_seconds"),
                    is_failed: is_failed != 0,
                    message: r.get("message"),
                })
            })
            .collect()
    }

    async fn create_blueprint(&self, bp: &Blueprint) -> CoreResult<Blueprint> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query(
            "INSERT INTO _tributary_blueprints (name, project_name, mode, enable, is_manual, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '{}', ?6, ?7)",
        )
        .bind(&bp.name)
        .bind(&bp.project_name)
        .bind(mode_str(bp.mode))
        .bind(bp.enable as i64)
        .bind(bp.is_manual as i64)
        .bind(bp.created_at.to_rfc3339())
        .bind(bp.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(unique_project_err)?;
        let mut created = bp.clone();
        created.id = BlueprintId(res.last_insert_rowid() as u64);
        sqlx::query("UPDATE _tributary_blueprints SET data = ?2 WHERE id = ?1")
            .bind(created.id.0 as i64)
            .bind(to_json(&created)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    async fn update_blueprint(&self, bp: &Blueprint) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE _tributary_blueprints SET
               name = ?2, project_name = ?3, mode = ?4, enable = ?5, is_manual = ?6, data = ?7, updated_at = ?8
             WHERE id = ?1",
        )
        .bind(bp.id.0 as i64)
        .bind(&bp.name)
        .bind(&bp.project_name)
        .bind(mode_str(bp.mode))
        .bind(bp.enable as i64)
        .bind(bp.is_manual as i64)
        .bind(to_json(bp)?)
        .bind(bp.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(unique_project_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("blueprint {}", bp.id)));
        }
        Ok(())
    }

    async fn get_blueprint(&self, id: BlueprintId) -> CoreResult<Option<Blueprint>> {
        let row = sqlx::query("SELECT id, data FROM _tributary_blueprints WHERE id = ?1")
            .bind(id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_blueprint(&r)).transpose()
    }

    async fn get_blueprint_by_project(&self, project_name: &str) -> CoreResult<Option<Blueprint>> {
        let row = sqlx::query("SELECT id, data FROM _tributary_blueprints WHERE project_name = ?1")
            .bind(project_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| row_to_blueprint(&r)).transpose()
    }

    async fn list_blueprints(&self, query: &BlueprintQuery) -> CoreResult<(Vec<Blueprint>, u64)> {
        let mut clauses: Vec<&str> = Vec::new();
        if query.enable.is_some() {
            clauses.push("enable = ?");
        }
        if query.is_manual.is_some() {
            clauses.push("is_manual = ?");
        }
        if query.mode.is_some() {
            clauses.push("mode = ?");
        }
        if query.label.is_some() {
            clauses.push("EXISTS (SELECT 1 FROM json_each(json_extract(data, '$.labels')) WHERE json_each.value = ?)");
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let count_sql = format!("SELECT COUNT(*) AS n FROM _tributary_blueprints {where_sql}");
        let list_sql =
            format!("SELECT id, data FROM _tributary_blueprints {where_sql} ORDER BY id LIMIT ? OFFSET ?");
        let mut count_q = sqlx::query(&count_sql);
        let mut list_q = sqlx::query(&list_sql);
        if let Some(e) = query.enable {
            count_q = count_q.bind(e as i64);
            list_q = list_q.bind(e as i64);
        }
        if let Some(m) = query.is_manual {
            count_q = count_q.bind(m as i64);
            list_q = list_q.bind(m as i64);
        }
        if let Some(m) = query.mode {
            count_q = count_q.bind(mode_str(m));
            list_q = list_q.bind(mode_str(m));
        }
        if let Some(l) = &query.label {
            count_q = count_q.bind(l.clone());
            list_q = list_q.bind(l.clone());
        }
        list_q = list_q
            .bind(query.pagination.limit() as i64)
            .bind(query.pagination.offset() as i64);
        let n: i64 = count_q
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get("n");
        let rows = list_q.fetch_all(&self.pool).await.map_err(db_err)?;
        let items = rows.iter().map(row_to_blueprint).collect::<CoreResult<Vec<_>>>()?;
        Ok((items, n as u64))
    }

    async fn delete_blueprint(&self, id: BlueprintId) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM _tributary_blueprints WHERE id = ?1")
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn create_connection(&self, c: &Connection) -> CoreResult<Connection> {
        let res = sqlx::query(
            "INSERT INTO _tributary_connections (plugin, name, endpoint, token, proxy, rate_limit_per_hour, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&c.plugin)
        .bind(&c.name)
        .bind(&c.endpoint)
        .bind(&c.token)
        .bind(&c.proxy)
        .bind(c.rate_limit_per_hour.map(|v| v as i64))
        .bind(c.created_at.to_rfc3339())
        .bind(c.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        let mut created = c.clone();
        created.id = ConnectionId(res.last_insert_rowid() as u64);
        Ok(created)
    }

    async fn update_connection(&self, c: &Connection) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE _tributary_connections SET name = ?3, endpoint = ?4, token = ?5, proxy = ?6, rate_limit_per_hour = ?7, updated_at = ?8
             WHERE plugin = ?1 AND id = ?2",
        )
        .bind(&c.plugin)
        .bind(c.id.0 as i64)
        .bind(&c.name)
        .bind(&c.endpoint)
        .bind(&c.token)
        .bind(&c.proxy)
        .bind(c.rate_limit_per_hour.map(|v| v as i64))
        .bind(c.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("connection {}", c.id)));
        }
        Ok(())
    }

    async fn get_connection(&self, plugin: &str, id: ConnectionId) -> CoreResult<Option<Connection>> {
        let row = sqlx::query(
            "SELECT id, plugin, name, endpoint, token, proxy, rate_limit_per_hour, created_at, updated_at
             FROM _tributary_connections WHERE plugin = ?1 AND id = ?2",
        )
        .bind(plugin)
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_connection(&r)).transpose()
    }

    async fn list_connections(&self, plugin: &str) -> CoreResult<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT id, plugin, name, endpoint, token, proxy, rate_limit_per_hour, created_at, updated_at
             FROM _tributary_connections WHERE plugin = ?1 ORDER BY id",
        )
        .bind(plugin)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_connection).collect()
    }

    async fn delete_connection(&self, plugin: &str, id: ConnectionId) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM _tributary_connections WHERE plugin = ?1 AND id = ?2")
            .bind(plugin)
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn save_scope(&self, s: &Scope) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO _tributary_scopes (plugin, connection_id, scope_id, name, full_name, scope_config_id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(plugin, connection_id, scope_id) DO UPDATE SET
               name = excluded.name,
               full_name = excluded.full_name,
               scope_config_id = excluded.scope_config_id,
               data = excluded.data,
               updated_at = excluded.updated_at",
        )
        .bind(&s.plugin)
        .bind(s.connection_id.0 as i64)
        .bind(&s.scope_id)
        .bind(&s.name)
        .bind(&s.full_name)
        .bind(s.scope_config_id.map(|c| c.0 as i64))
        .bind(to_json(&s.data)?)
        .bind(s.created_at.to_rfc3339())
        .bind(s.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_scope(&self, plugin: &str, connection_id: ConnectionId, scope_id: &str) -> CoreResult<Option<Scope>> {
        let row = sqlx::query(
            "SELECT plugin, connection_id, scope_id, name, full_name, scope_config_id, data, created_at, updated_at
             FROM _tributary_scopes WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3",
        )
        .bind(plugin)
        .bind(connection_id.0 as i64)
        .bind(scope_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_scope(&r)).transpose()
    }

    async fn list_scopes(&self, plugin: &str, connection_id: ConnectionId) -> CoreResult<Vec<Scope>> {
        let rows = sqlx::query(
            "SELECT plugin, connection_id, scope_id, name, full_name, scope_config_id, data, created_at, updated_at
             FROM _tributary_scopes WHERE plugin = ?1 AND connection_id = ?2 ORDER BY scope_id",
        )
        .bind(plugin)
        .bind(connection_id.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_scope).collect()
    }

    async fn count_scopes(&self, plugin: &str, connection_id: ConnectionId) -> CoreResult<u64> {
        let n: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM _tributary_scopes WHERE plugin = ?1 AND connection_id = ?2",
        )
        .bind(plugin)
        .bind(connection_id.0 as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("n");
        Ok(n as u64)
    }

    async fn count_scopes_with_config(&self, plugin: &str, scope_config_id: ScopeConfigId) -> CoreResult<u64> {
        let n: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM _tributary_scopes WHERE plugin = ?1 AND scope_config_id = ?2",
        )
        .bind(plugin)
        .bind(scope_config_id.0 as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get("n");
        Ok(n as u64)
    }

    async fn create_scope_config(&self, c: &ScopeConfig) -> CoreResult<ScopeConfig> {
        let res = sqlx::query(
            "INSERT INTO _tributary_scope_configs (plugin, connection_id, name, entities, settings, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&c.plugin)
        .bind(c.connection_id.map(|id| id.0 as i64))
        .bind(&c.name)
        .bind(to_json(&c.entities)?)
        .bind(to_json(&c.settings)?)
        .bind(c.created_at.to_rfc3339())
        .bind(c.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        let mut created = c.clone();
        created.id = ScopeConfigId(res.last_insert_rowid() as u64);
        Ok(created)
    }

    async fn update_scope_config(&self, c: &ScopeConfig) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE _tributary_scope_configs SET connection_id = ?3, name = ?4, entities = ?5, settings = ?6, updated_at = ?7
             WHERE plugin = ?1 AND id = ?2",
        )
        .bind(&c.plugin)
        .bind(c.id.0 as i64)
        .bind(c.connection_id.map(|id| id.0 as i64))
        .bind(&c.name)
        .bind(to_json(&c.entities)?)
        .bind(to_json(&c.settings)?)
        .bind(c.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("scope config {}", c.id)));
        }
        Ok(())
    }

    async fn get_scope_config(&self, plugin: &str, id: ScopeConfigId) -> CoreResult<Option<ScopeConfig>> {
        let row = sqlx::query(
            "SELECT id, plugin, connection_id, name, entities, settings, created_at, updated_at
             FROM _tributary_scope_configs WHERE plugin = ?1 AND id = ?2",
        )
        .bind(plugin)
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_scope_config(&r)).transpose()
    }

    async fn list_scope_configs(&self, plugin: &str) -> CoreResult<Vec<ScopeConfig>> {
        let rows = sqlx::query(
            "SELECT id, plugin, connection_id, name, entities, settings, created_at, updated_at
             FROM _tributary_scope_configs WHERE plugin = ?1 ORDER BY id",
        )
        .bind(plugin)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_scope_config).collect()
    }

    async fn delete_scope_config(&self, plugin: &str, id: ScopeConfigId) -> CoreResult<bool> {
        let res = sqlx::query("DELETE FROM _tributary_scope_configs WHERE plugin = ?1 AND id = ?2")
            .bind(plugin)
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_collector_state(&self, raw_table: &str, raw_params: &str) -> CoreResult<Option<CollectorState>> {
        let row = sqlx::query(
            "SELECT raw_data_table, raw_data_params, latest_success_start, time_after, prev_config, updated_at
             FROM _tributary_collector_states WHERE raw_data_table = ?1 AND raw_data_params = ?2",
        )
        .bind(raw_table)
        .bind(raw_params)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| -> CoreResult<CollectorState> {
            let updated_at: String = r.get("updated_at");
            Ok(CollectorState {
                raw_data_table: r.get("raw_data_table"),
                raw_data_params: r.get("raw_data_params"),
                latest_success_start: parse_opt_dt(r.get("latest_success_start"))?,
                time_after: parse_opt_dt(r.get("time_after"))?,
                prev_config: r.get("prev_config"),
                updated_at: parse_dt(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn save_collector_state(&self, s: &CollectorState) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO _tributary_collector_states (raw_data_table, raw_data_params, latest_success_start, time_after, prev_config, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(raw_data_table, raw_data_params) DO UPDATE SET
               latest_success_start = excluded.latest_success_start,
               time_after = excluded.time_after,
               prev_config = excluded.prev_config,
               updated_at = excluded.updated_at",
        )
        .bind(&s.raw_data_table)
        .bind(&s.raw_data_params)
        .bind(s.latest_success_start.map(|d| d.to_rfc3339()))
        .bind(s.time_after.map(|d| d.to_rfc3339()))
        .bind(&s.prev_config)
        .bind(s.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn purge_scope(&self, purge: &ScopePurge) -> CoreResult<PurgeReport> {
        let prefix = raw_table_prefix(&purge.plugin);
        let pattern = like_prefix(&prefix);
        let params = purge.raw_data_params.as_str();
        let mut report = PurgeReport::default();

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let tables = sqlx::query("SELECT name FROM _tributary_tables ORDER BY name")
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        for r in &tables {
            let name: String = r.get("name");
            validate_table_name(&name)?;
            match table_kind(&name) {
                TableKind::Meta => continue,
                TableKind::Raw => {
                    if !name.starts_with(&prefix) {
                        continue;
                    }
                    let res = sqlx::query(&format!("DELETE FROM {name} WHERE params = ?1"))
                        .bind(params)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    report.raw_rows += res.rows_affected();
                }
                kind => {
                    let res = sqlx::query(&format!(
                        "DELETE FROM {name} WHERE _raw_data_table LIKE ?1 ESCAPE '\\' AND _raw_data_params = ?2"
                    ))
                    .bind(&pattern)
                    .bind(params)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    if kind == TableKind::Tool {
                        report.tool_rows += res.rows_affected();
                    } else {
                        report.domain_rows += res.rows_affected();
                    }
                }
            }
        }

        let res = sqlx::query(
            "DELETE FROM _tributary_collector_states WHERE raw_data_table LIKE ?1 ESCAPE '\\' AND raw_data_params = ?2",
        )
        .bind(&pattern)
        .bind(params)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        report.collector_states = res.rows_affected();

        if let Some((connection_id, scope_id)) = &purge.scope {
            let res = sqlx::query(
                "DELETE FROM _tributary_scopes WHERE plugin = ?1 AND connection_id = ?2 AND scope_id = ?3",
            )
            .bind(&purge.plugin)
            .bind(connection_id.0 as i64)
            .bind(scope_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            report.scope_deleted = res.rows_affected() > 0;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(report)
    }
}

// ── RecordStore impl ───────────────────────────────────────────

#[async_trait]
impl RecordStore for SqliteStore {
    async fn ensure_raw_table(&self, table: &str) -> CoreResult<()> {
        validate_table_name(table)?;
        if table_kind(table) != TableKind::Raw {
            return Err(CoreError::InvalidInput(format!(
                "raw table must start with {RAW_TABLE_PREFIX}: {table}"
            )));
        }
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                params TEXT NOT NULL,
                data TEXT NOT NULL,
                url TEXT NOT NULL,
                input TEXT,
                fingerprint TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (params, fingerprint)
            );
            CREATE INDEX IF NOT EXISTS {table}_params_idx ON {table}(params);"
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        register_table(&self.pool, table, "raw").await
    }

    async fn insert_raw(&self, table: &str, params: &str, rows: &[NewRawRecord]) -> CoreResult<u64> {
        validate_table_name(table)?;
        let sql = format!(
            "INSERT OR IGNORE INTO {table} (params, data, url, input, fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        );
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0;
        for row in rows {
            let res = sqlx::query(&sql)
                .bind(params)
                .bind(to_json(&row.data)?)
                .bind(&row.url)
                .bind(row.input.as_ref().map(to_json).transpose()?)
                .bind(row.fingerprint())
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            inserted += res.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn delete_raw(&self, table: &str, params: &str) -> CoreResult<u64> {
        validate_table_name(table)?;
        let res = sqlx::query(&format!("DELETE FROM {table} WHERE params = ?1"))
            .bind(params)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected())
    }

    async fn fetch_raw(&self, table: &str, params: &str, after_id: u64, limit: usize) -> CoreResult<Vec<RawRecord>> {
        validate_table_name(table)?;
        let rows = sqlx::query(&format!(
            "SELECT id, params, data, url, input, fingerprint, created_at FROM {table}
             WHERE params = ?1 AND id > ?2 ORDER BY id LIMIT ?3"
        ))
        .bind(params)
        .bind(after_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                let id: i64 = r.get("id");
                let data: String = r.get("data");
                let input: Option<String> = r.get("input");
                let created_at: String = r.get("created_at");
                Ok(RawRecord {
                    id: id as u64,
                    params: r.get("params"),
                    data: from_json(&data)?,
                    url: r.get("url"),
                    input: input.map(|s| from_json(&s)).transpose()?,
                    fingerprint: r.get("fingerprint"),
                    created_at: parse_dt(&created_at)?,
                })
            })
            .collect()
    }

    async fn count_raw(&self, table: &str, params: &str) -> CoreResult<u64> {
        validate_table_name(table)?;
        let n: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table} WHERE params = ?1"))
            .bind(params)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get("n");
        Ok(n as u64)
    }

    async fn ensure_record_table(&self, table: &str) -> CoreResult<()> {
        validate_table_name(table)?;
        let kind = match table_kind(table) {
            TableKind::Tool => "tool",
            TableKind::Domain => "domain",
            TableKind::Raw | TableKind::Meta => {
                return Err(CoreError::InvalidInput(format!(
                    "record table must be a tool or domain table: {table}"
                )));
            }
        };
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                _raw_data_table TEXT NOT NULL,
                _raw_data_params TEXT NOT NULL,
                _raw_data_id INTEGER NOT NULL,
                _raw_data_remark TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_raw_params_idx ON {table}(_raw_data_params);"
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        register_table(&self.pool, table, kind).await
    }

    async fn upsert_records(&self, table: &str, records: &[Record]) -> CoreResult<u64> {
        validate_table_name(table)?;
        let sql = format!(
            "INSERT INTO {table} (key, data, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
               data = excluded.data,
               _raw_data_table = excluded._raw_data_table,
               _raw_data_params = excluded._raw_data_params,
               _raw_data_id = excluded._raw_data_id,
               _raw_data_remark = excluded._raw_data_remark,
               updated_at = excluded.updated_at"
        );
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for r in records {
            sqlx::query(&sql)
                .bind(&r.key)
                .bind(to_json(&r.data)?)
                .bind(&r.origin.raw_data_table)
                .bind(&r.origin.raw_data_params)
                .bind(r.origin.raw_data_id as i64)
                .bind(&r.origin.raw_data_remark)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(records.len() as u64)
    }

    async fn get_record(&self, table: &str, key: &str) -> CoreResult<Option<Record>> {
        validate_table_name(table)?;
        let row = sqlx::query(&format!(
            "SELECT key, data, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark FROM {table} WHERE key = ?1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    async fn fetch_records(
        &self,
        table: &str,
        filter: &RecordFilter,
        after_key: Option<&str>,
        limit: usize,
    ) -> CoreResult<Vec<Record>> {
        validate_table_name(table)?;
        let (where_sql, binds) = filter_sql(filter, after_key);
        let sql = format!(
            "SELECT key, data, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark FROM {table}
             {where_sql} ORDER BY key LIMIT ?"
        );
        let mut q = sqlx::query(&sql);
        for b in binds {
            q = q.bind(b);
        }
        let rows = q
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn count_records(&self, table: &str, filter: &RecordFilter) -> CoreResult<u64> {
        validate_table_name(table)?;
        let (where_sql, binds) = filter_sql(filter, None);
        let sql = format!("SELECT COUNT(*) AS n FROM {table} {where_sql}");
        let mut q = sqlx::query(&sql);
        for b in binds {
            q = q.bind(b);
        }
        let n: i64 = q.fetch_one(&self.pool).await.map_err(db_err)?.get("n");
        Ok(n as u64)
    }

    async fn delete_records(&self, table: &str, filter: &RecordFilter) -> CoreResult<u64> {
        validate_table_name(table)?;
        let (where_sql, binds) = filter_sql(filter, None);
        let sql = format!("DELETE FROM {table} {where_sql}");
        let mut q = sqlx::query(&sql);
        for b in binds {
            q = q.bind(b);
        }
        let res = q.execute(&self.pool).await.map_err(db_err)?;
        Ok(res.rows_affected())
    }

    async fn list_tables(&self) -> CoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM _tributary_tables ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }
}

// ── Row mapping helpers ─────────────────────────────────────────

fn mode_str(mode: BlueprintMode) -> &'static str {
    match mode {
        BlueprintMode::Normal => "NORMAL",
        BlueprintMode::Advanced => "ADVANCED",
    }
}

fn unique_project_err(e: sqlx::Error) -> CoreError {
    match &e {
        sqlx::Error::Database(d) if d.message().contains("UNIQUE") => {
            CoreError::Conflict("project already has a blueprint".to_string())
        }
        _ => db_err(e),
    }
}

fn filter_sql(filter: &RecordFilter, after_key: Option<&str>) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    if let Some(t) = &filter.raw_data_table {
        clauses.push("_raw_data_table = ?");
        binds.push(t.clone());
    }
    if let Some(p) = &filter.raw_data_params {
        clauses.push("_raw_data_params = ?");
        binds.push(p.clone());
    }
    if let Some(k) = after_key {
        clauses.push("key > ?");
        binds.push(k.to_string());
    }
    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn row_to_pipeline(r: &SqliteRow) -> CoreResult<Pipeline> {
    let id: i64 = r.get("id");
    let blueprint_id: Option<i64> = r.get("blueprint_id");
    let plan: String = r.get("plan");
    let status: String = r.get("status");
    let total_tasks: i64 = r.get("total_tasks");
    let finished_tasks: i64 = r.get("finished_tasks");
    let labels: String = r.get("labels");
    let sync_policy: String = r.get("sync_policy");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    Ok(Pipeline {
        id: PipelineId(id as u64),
        name: r.get("name"),
        blueprint_id: blueprint_id.map(|b| BlueprintId(b as u64)),
        plan: from_json(&plan)?,
        status: parse_status(&status)?,
        total_tasks: total_tasks as u64,
        finished_tasks: finished_tasks as u64,
        labels: from_json(&labels)?,
        sync_policy: from_json(&sync_policy)?,
        message: r.get("message"),
        error_name: r.get("error_name"),
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
        began_at: parse_opt_dt(r.get("began_at"))?,
        finished_at: parse_opt_dt(r.get("finished_at"))?,
        spent_seconds: r.get("spent_seconds"),
    })
}

fn row_to_task(r: &SqliteRow) -> CoreResult<Task> {
    let id: i64 = r.get("id");
    let pipeline_id: i64 = r.get("pipeline_id");
    let row: i64 = r.get("pipeline_row");
    let col: i64 = r.get("pipeline_col");
    let subtasks: String = r.get("subtasks");
    let options: String = r.get("options");
    let status: String = r.get("status");
    let progress: String = r.get("progress");
    let created_at: String = r.get("created_at");
    Ok(Task {
        id: TaskId(id as u64),
        pipeline_id: PipelineId(pipeline_id as u64),
        pipeline_row: row as u32,
        pipeline_col: col as u32,
        plugin: r.get("plugin"),
        subtasks: from_json(&subtasks)?,
        options: from_json(&options)?,
        status: parse_status(&status)?,
        message: r.get("message"),
        error_name: r.get("error_name"),
        failed_sub_task: r.get("failed_sub_task"),
        progress: from_json(&progress)?,
        created_at: parse_dt(&created_at)?,
        began_at: parse_opt_dt(r.get("began_at"))?,
        finished_at: parse_opt_dt(r.get("finished_at"))?,
        spent_seconds: r.get("spent_seconds"),
    })
}

fn row_to_blueprint(r: &SqliteRow) -> CoreResult<Blueprint> {
    let id: i64 = r.get("id");
    let data: String = r.get("data");
    let mut bp: Blueprint = from_json(&data)?;
    bp.id = BlueprintId(id as u64);
    Ok(bp)
}

fn row_to_connection(r: &SqliteRow) -> CoreResult<Connection> {
    let id: i64 = r.get("id");
    let rate: Option<i64> = r.get("rate_limit_per_hour");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    Ok(Connection {
        id: ConnectionId(id as u64),
        plugin: r.get("plugin"),
        name: r.get("name"),
        endpoint: r.get("endpoint"),
        token: r.get("token"),
        proxy: r.get("proxy"),
        rate_limit_per_hour: rate.map(|v| v as u32),
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_scope(r: &SqliteRow) -> CoreResult<Scope> {
    let connection_id: i64 = r.get("connection_id");
    let scope_config_id: Option<i64> = r.get("scope_config_id");
    let data: String = r.get("data");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    Ok(Scope {
        plugin: r.get("plugin"),
        connection_id: ConnectionId(connection_id as u64),
        scope_id: r.get("scope_id"),
        name: r.get("name"),
        full_name: r.get("full_name"),
        scope_config_id: scope_config_id.map(|c| ScopeConfigId(c as u64)),
        data: from_json(&data)?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_scope_config(r: &SqliteRow) -> CoreResult<ScopeConfig> {
    let id: i64 = r.get("id");
    let connection_id: Option<i64> = r.get("connection_id");
    let entities: String = r.get("entities");
    let settings: String = r.get("settings");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");
    Ok(ScopeConfig {
        id: ScopeConfigId(id as u64),
        plugin: r.get("plugin"),
        connection_id: connection_id.map(|c| ConnectionId(c as u64)),
        name: r.get("name"),
        entities: from_json(&entities)?,
        settings: from_json(&settings)?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_record(r: &SqliteRow) -> CoreResult<Record> {
    let data: String = r.get("data");
    let raw_id: i64 = r.get("_raw_data_id");
    Ok(Record {
        key: r.get("key"),
        data: from_json(&data)?,
        origin: RawDataOrigin {
            raw_data_table: r.get("_raw_data_table"),
            raw_data_params: r.get("_raw_data_params"),
            raw_data_id: raw_id as u64,
            raw_data_remark: r.get("_raw_data_remark"),
        },
    })
}
