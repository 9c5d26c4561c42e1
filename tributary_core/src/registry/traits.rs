use crate::Result;
use crate::models::SyncPolicy;
use crate::pipelines::models::PipelinePlan;
use crate::registry::models::{Capabilities, SubTaskMeta};
use crate::sources::models::{Connection, Scope, ScopeConfig, ScopeInput};
use crate::subtask::context::{TaskContext, TaskData};
use async_trait::async_trait;
use serde_json::Value;

/// A statically linked data source.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Subtasks in execution order.
    fn subtask_metas(&self) -> Vec<SubTaskMeta>;

    /// Decode options and build whatever the subtasks share (clients, parsed options).
    async fn prepare_task_data(&self, ctx: &TaskContext) -> Result<TaskData>;

    /// Called once the task finished, whatever its outcome.
    async fn close_task(&self, _ctx: &TaskContext, _data: &TaskData) -> Result<()> {
        Ok(())
    }

    fn scope_source(&self) -> Option<&dyn ScopeSource> {
        None
    }

    fn table_producer(&self) -> Option<&dyn TableProducer> {
        None
    }

    fn open_api(&self) -> Option<&dyn OpenApiProvider> {
        None
    }

    fn plan_maker(&self) -> Option<&dyn PlanMaker> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        let scopes = self.scope_source();
        Capabilities {
            has_scopes: scopes.is_some(),
            has_connections: scopes.is_some(),
            has_scope_configs: scopes.is_some_and(|s| s.has_scope_configs()),
            produces_tables: self.table_producer().is_some(),
            has_open_api: self.open_api().is_some(),
            has_plan_maker: self.plan_maker().is_some(),
        }
    }
}

/// Exposes connections, scopes and scope configs for a plugin.
pub trait ScopeSource: Send + Sync {
    /// Domain type name of the scope, e.g. `GithubRepo`.
    fn scope_type(&self) -> &str;

    /// Canonical parameters that fingerprint every row collected for `scope`.
    fn scope_params(&self, scope: &Scope) -> Value;

    fn validate_scope(&self, _scope: &ScopeInput) -> Result<()> {
        Ok(())
    }

    fn has_scope_configs(&self) -> bool {
        true
    }
}

/// Declares the tool and domain tables a plugin writes.
pub trait TableProducer: Send + Sync {
    fn tables(&self) -> Vec<String>;
}

pub trait OpenApiProvider: Send + Sync {
    fn open_api_fragment(&self) -> Value;
}

/// One scope with its resolved config, as handed to a plan maker.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanScope {
    pub scope: Scope,
    pub scope_config: Option<ScopeConfig>,
}

#[derive(Debug, Clone)]
pub struct PlanContext {
    pub connection: Connection,
    pub scopes: Vec<PlanScope>,
    pub sync_policy: SyncPolicy,
}

/// Turns a blueprint connection into pipeline stages.
#[async_trait]
pub trait PlanMaker: Send + Sync {
    async fn make_plan(&self, ctx: &PlanContext) -> Result<PipelinePlan>;
}
