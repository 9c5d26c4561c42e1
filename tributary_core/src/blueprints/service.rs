use crate::blueprints::models::{
    Blueprint, BlueprintList, BlueprintMode, BlueprintPatch, BlueprintQuery, MANUAL_CRON, NewBlueprint,
};
use crate::blueprints::schedule::{next_run, parse_cron_config};
use crate::models::BlueprintId;
use crate::pipelines::PipelineOrchestrator;
use crate::pipelines::models::{NewPipeline, Pipeline, PipelinePlan, plan_task_count};
use crate::registry::PluginRegistry;
use crate::registry::traits::{PlanContext, PlanScope};
use crate::storage::traits::MetaStore;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// Blueprint CRUD plus turning a blueprint into a pipeline.
pub struct BlueprintService {
    meta: Arc<dyn MetaStore>,
    registry: Arc<PluginRegistry>,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl BlueprintService {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self {
            meta: orchestrator.meta().clone(),
            registry: orchestrator.registry().clone(),
            orchestrator,
        }
    }

    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    #[tracing::instrument(level = "info", skip(self, new), fields(name = %new.name))]
    pub async fn create(&self, new: NewBlueprint) -> Result<Blueprint> {
        let now = Utc::now();
        let cron_config = new
            .cron_config
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| MANUAL_CRON.to_string());
        let mut bp = Blueprint {
            id: BlueprintId(0),
            name: new.name,
            project_name: new.project_name.filter(|p| !p.trim().is_empty()),
            mode: new.mode,
            plan: new.plan,
            before_plan: new.before_plan,
            after_plan: new.after_plan,
            connections: new.connections,
            labels: new.labels,
            enable: new.enable,
            is_manual: false,
            cron_config,
            sync_policy: new.sync_policy,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.validate(&mut bp)?;
        bp.next_run_at = next_run(&bp, now)?;
        let bp = self.meta.create_blueprint(&bp).await?;
        tracing::info!(blueprint_id = %bp.id, "blueprint created");
        Ok(bp)
    }

    #[tracing::instrument(level = "info", skip(self, patch))]
    pub async fn update(&self, id: BlueprintId, patch: BlueprintPatch) -> Result<Blueprint> {
        let mut bp = self.get(id).await?;
        let old_cron = (bp.cron_config.clone(), bp.is_scheduled());
        patch.apply(&mut bp);
        self.validate(&mut bp)?;
        let now = Utc::now();
        if old_cron != (bp.cron_config.clone(), bp.is_scheduled()) || bp.next_run_at.is_none() {
            bp.next_run_at = next_run(&bp, now)?;
        }
        bp.updated_at = now;
        self.meta.update_blueprint(&bp).await?;
        Ok(bp)
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete(&self, id: BlueprintId) -> Result<()> {
        if !self.meta.delete_blueprint(id).await? {
            return Err(Error::NotFound(format!("blueprint {id}")));
        }
        Ok(())
    }

    pub async fn get(&self, id: BlueprintId) -> Result<Blueprint> {
        self.meta
            .get_blueprint(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("blueprint {id}")))
    }

    pub async fn get_by_project(&self, project_name: &str) -> Result<Blueprint> {
        self.meta
            .get_blueprint_by_project(project_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("blueprint of project {project_name}")))
    }

    pub async fn list(&self, query: &BlueprintQuery) -> Result<BlueprintList> {
        let (blueprints, count) = self.meta.list_blueprints(query).await?;
        Ok(BlueprintList { blueprints, count })
    }

    /// Resolve the blueprint into a plan and submit it as a pipeline.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn trigger(&self, id: BlueprintId) -> Result<Pipeline> {
        let bp = self.get(id).await?;
        if !bp.enable {
            return Err(Error::InvalidInput("blueprint is not enabled".to_string()));
        }
        self.trigger_blueprint(&bp).await
    }

    pub(crate) async fn trigger_blueprint(&self, bp: &Blueprint) -> Result<Pipeline> {
        let plan = self.make_plan(bp).await?;
        self.orchestrator
            .submit(NewPipeline {
                name: bp.name.clone(),
                plan,
                blueprint_id: Some(bp.id),
                labels: bp.labels.clone(),
                sync_policy: bp.sync_policy.clone(),
            })
            .await
    }

    /// The concrete plan a trigger would run right now.
    ///
    /// NORMAL blueprints ask each plugin's plan maker for stages over the live
    /// connection, scopes and scope configs. Stages at the same depth from
    /// different connections are merged so they run side by side, and the
    /// result is wrapped in `beforePlan` and `afterPlan`.
    #[tracing::instrument(level = "debug", skip(self, bp), fields(blueprint_id = %bp.id))]
    pub async fn make_plan(&self, bp: &Blueprint) -> Result<PipelinePlan> {
        if bp.mode == BlueprintMode::Advanced {
            return Ok(bp.plan.clone());
        }
        let mut generated: PipelinePlan = Vec::new();
        for bc in &bp.connections {
            let plugin = self.registry.get(&bc.plugin_name)?;
            let maker = plugin.plan_maker().ok_or_else(|| {
                Error::InvalidInput(format!("plugin {} cannot generate plans", bc.plugin_name))
            })?;
            let connection = self
                .meta
                .get_connection(&bc.plugin_name, bc.connection_id)
                .await?
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "connection {}:{} no longer exists",
                        bc.plugin_name, bc.connection_id
                    ))
                })?;
            let mut scopes = Vec::with_capacity(bc.scopes.len());
            for s in &bc.scopes {
                let scope = self
                    .meta
                    .get_scope(&bc.plugin_name, bc.connection_id, &s.scope_id)
                    .await?
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "scope {} of connection {}:{} no longer exists",
                            s.scope_id, bc.plugin_name, bc.connection_id
                        ))
                    })?;
                let scope_config = match scope.scope_config_id {
                    Some(cid) => self.meta.get_scope_config(&bc.plugin_name, cid).await?,
                    None => None,
                };
                scopes.push(PlanScope { scope, scope_config });
            }
            let plan = maker
                .make_plan(&PlanContext {
                    connection,
                    scopes,
                    sync_policy: bp.sync_policy.clone(),
                })
                .await?;
            merge_stages(&mut generated, plan);
        }

        let mut plan = Vec::new();
        for stage in bp.before_plan.iter().chain(&generated).chain(&bp.after_plan) {
            if !stage.is_empty() {
                plan.push(stage.clone());
            }
        }
        Ok(plan)
    }

    fn validate(&self, bp: &mut Blueprint) -> Result<()> {
        if bp.name.trim().is_empty() {
            return Err(Error::InvalidInput("blueprint name is empty".to_string()));
        }
        bp.is_manual = parse_cron_config(&bp.cron_config)?.is_none();
        if bp.is_manual {
            bp.cron_config = MANUAL_CRON.to_string();
        }
        match bp.mode {
            BlueprintMode::Advanced => {
                if plan_task_count(&bp.plan) == 0 {
                    return Err(Error::InvalidInput(
                        "advanced blueprint requires a non-empty plan".to_string(),
                    ));
                }
                self.orchestrator.plan_tasks(&bp.plan)?;
            }
            BlueprintMode::Normal => {
                for c in &bp.connections {
                    if !self.registry.contains(&c.plugin_name) {
                        return Err(Error::InvalidInput(format!(
                            "plugin {} is not registered",
                            c.plugin_name
                        )));
                    }
                }
                for extra in [&bp.before_plan, &bp.after_plan] {
                    if plan_task_count(extra) > 0 {
                        self.orchestrator.plan_tasks(extra)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Append `other` stage by stage, so stage `i` of both plans runs together.
fn merge_stages(into: &mut PipelinePlan, other: PipelinePlan) {
    for (i, stage) in other.into_iter().enumerate() {
        match into.get_mut(i) {
            Some(existing) => existing.extend(stage),
            None => into.push(stage),
        }
    }
}
