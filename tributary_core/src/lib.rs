//! Tributary core: the pipeline engine that collects data from external APIs
//! through plugins and turns it into a uniform domain model.
//!
//! Submitted pipelines run stage by stage; each task runs its plugin's
//! subtasks (collect, extract, convert, enrich) against the storage layer.
//! Blueprints turn connections and scopes into pipelines on demand or on a
//! cron schedule.

#![forbid(unsafe_code)]

pub mod blueprints;
pub mod collector;
pub mod config;
pub mod domain;
pub mod error;
pub mod models;
pub mod o11y;
pub mod pipelines;
pub mod registry;
pub mod runner;
pub mod sources;
pub mod storage;
pub mod subtask;

#[cfg(test)]
mod test_support;

pub use blueprints::{Blueprint, BlueprintScheduler, BlueprintService};
pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use models::{BlueprintId, ConnectionId, Pagination, PipelineId, ScopeConfigId, Status, SyncPolicy, TaskId};
pub use pipelines::{Pipeline, PipelineOrchestrator, PipelineQueue, Task};
pub use registry::{Plugin, PluginRegistry};
pub use runner::TaskRunner;
pub use sources::SourceService;
