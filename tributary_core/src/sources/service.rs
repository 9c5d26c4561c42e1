use crate::blueprints::models::{Blueprint, BlueprintMode, BlueprintQuery};
use crate::collector::client::ApiClientPool;
use crate::domain::lineage::canonical_params;
use crate::models::{ConnectionId, Pagination, ScopeConfigId};
use crate::registry::PluginRegistry;
use crate::registry::traits::{Plugin, ScopeSource};
use crate::sources::models::{
    Connection, ConnectionInput, DsRefs, PurgeReport, Scope, ScopeConfig, ScopeConfigInput, ScopeInput,
};
use crate::storage::lock::PipelineGuard;
use crate::storage::traits::{MetaStore, SCOPES_TABLE, ScopePurge, TASKS_TABLE};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// Connections, scopes and scope configs of scope-aware plugins, with the
/// reference checks that keep blueprints from dangling.
pub struct SourceService {
    meta: Arc<dyn MetaStore>,
    registry: Arc<PluginRegistry>,
    guard: PipelineGuard,
    clients: Arc<ApiClientPool>,
}

impl SourceService {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        registry: Arc<PluginRegistry>,
        guard: PipelineGuard,
        clients: Arc<ApiClientPool>,
    ) -> Self {
        Self {
            meta,
            registry,
            guard,
            clients,
        }
    }

    fn scoped_plugin(&self, plugin: &str) -> Result<Arc<dyn Plugin>> {
        let p = self.registry.get(plugin)?;
        if p.scope_source().is_none() {
            return Err(Error::InvalidInput(format!("plugin {plugin} has no connections or scopes")));
        }
        Ok(p)
    }

    // ── connections ────────────────────────────────────────────

    pub async fn list_connections(&self, plugin: &str) -> Result<Vec<Connection>> {
        self.scoped_plugin(plugin)?;
        let conns = self.meta.list_connections(plugin).await?;
        Ok(conns.iter().map(Connection::sanitized).collect())
    }

    pub async fn get_connection(&self, plugin: &str, id: ConnectionId) -> Result<Connection> {
        self.scoped_plugin(plugin)?;
        self.meta
            .get_connection(plugin, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {plugin}:{id}")))
    }

    /// Create (`id = None`) or replace a connection. Cached API clients for it are dropped.
    #[tracing::instrument(level = "info", skip(self, input))]
    pub async fn save_connection(
        &self,
        plugin: &str,
        id: Option<ConnectionId>,
        input: ConnectionInput,
    ) -> Result<Connection> {
        self.scoped_plugin(plugin)?;
        input.validate()?;
        let now = Utc::now();
        let saved = match id {
            Some(id) => {
                let mut c = self.get_connection(plugin, id).await?;
                c.name = input.name;
                c.endpoint = input.endpoint;
                // an omitted token keeps the stored one
                if input.token.is_some() {
                    c.token = input.token;
                }
                c.proxy = input.proxy;
                c.rate_limit_per_hour = input.rate_limit_per_hour;
                c.updated_at = now;
                self.meta.update_connection(&c).await?;
                c
            }
            None => {
                self.meta
                    .create_connection(&Connection {
                        id: ConnectionId(0),
                        plugin: plugin.to_string(),
                        name: input.name,
                        endpoint: input.endpoint,
                        token: input.token,
                        proxy: input.proxy,
                        rate_limit_per_hour: input.rate_limit_per_hour,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?
            }
        };
        self.clients.invalidate(plugin, saved.id);
        Ok(saved.sanitized())
    }

    /// Refuses while scopes remain attached or a NORMAL blueprint collects it.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_connection(&self, plugin: &str, id: ConnectionId) -> Result<Connection> {
        let _lock = self.guard.lock_tables(&[SCOPES_TABLE]).await?;
        let conn = self.get_connection(plugin, id).await?;
        let refs = self.blueprint_refs(plugin, id, None).await?;
        if !refs.is_empty() {
            return Err(Error::Referenced {
                message: format!("connection {plugin}:{id} is used by blueprints"),
                refs,
            });
        }
        let scopes = self.meta.count_scopes(plugin, id).await?;
        if scopes > 0 {
            return Err(Error::Conflict(format!(
                "connection {plugin}:{id} still has {scopes} scope(s); delete them first"
            )));
        }
        self.meta.delete_connection(plugin, id).await?;
        self.clients.invalidate(plugin, id);
        tracing::info!(plugin, connection_id = %id, "connection deleted");
        Ok(conn.sanitized())
    }

    // ── scopes ─────────────────────────────────────────────────

    pub async fn list_scopes(&self, plugin: &str, connection_id: ConnectionId) -> Result<Vec<Scope>> {
        self.get_connection(plugin, connection_id).await?;
        self.meta.list_scopes(plugin, connection_id).await
    }

    pub async fn get_scope(&self, plugin: &str, connection_id: ConnectionId, scope_id: &str) -> Result<Scope> {
        self.scoped_plugin(plugin)?;
        self.meta
            .get_scope(plugin, connection_id, scope_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scope {plugin}:{connection_id}:{scope_id}")))
    }

    /// Insert or replace scopes of one connection.
    #[tracing::instrument(level = "info", skip(self, inputs), fields(count = inputs.len()))]
    pub async fn save_scopes(
        &self,
        plugin: &str,
        connection_id: ConnectionId,
        inputs: Vec<ScopeInput>,
    ) -> Result<Vec<Scope>> {
        let p = self.scoped_plugin(plugin)?;
        let source = scope_source(p.as_ref())?;
        let _lock = self.guard.lock_tables(&[SCOPES_TABLE]).await?;
        self.get_connection(plugin, connection_id).await?;
        for input in &inputs {
            if input.scope_id.trim().is_empty() {
                return Err(Error::InvalidInput("scopeId is empty".to_string()));
            }
            source.validate_scope(input)?;
            if let Some(cid) = input.scope_config_id {
                self.get_scope_config(plugin, cid).await?;
            }
        }
        let now = Utc::now();
        let mut saved = Vec::with_capacity(inputs.len());
        for input in inputs {
            let created_at = self
                .meta
                .get_scope(plugin, connection_id, &input.scope_id)
                .await?
                .map_or(now, |s| s.created_at);
            let scope = Scope {
                plugin: plugin.to_string(),
                connection_id,
                scope_id: input.scope_id,
                name: input.name,
                full_name: input.full_name,
                scope_config_id: input.scope_config_id,
                data: input.data,
                created_at,
                updated_at: now,
            };
            self.meta.save_scope(&scope).await?;
            saved.push(scope);
        }
        Ok(saved)
    }

    /// Delete a scope and every row it produced, or only the rows when `data_only`.
    ///
    /// Runs only while no pipeline is running. A scope still collected by a
    /// NORMAL blueprint cannot be removed; its data can.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_scope(
        &self,
        plugin: &str,
        connection_id: ConnectionId,
        scope_id: &str,
        data_only: bool,
    ) -> Result<PurgeReport> {
        let p = self.scoped_plugin(plugin)?;
        let source = scope_source(p.as_ref())?;
        let scope = self.get_scope(plugin, connection_id, scope_id).await?;
        if !data_only {
            let refs = self.blueprint_refs(plugin, connection_id, Some(scope_id)).await?;
            if !refs.is_empty() {
                return Err(Error::Referenced {
                    message: format!("scope {scope_id} is used by blueprints"),
                    refs,
                });
            }
        }
        let purge = ScopePurge {
            plugin: plugin.to_string(),
            raw_data_params: canonical_params(&source.scope_params(&scope)),
            scope: (!data_only).then(|| (connection_id, scope_id.to_string())),
        };
        let meta = self.meta.clone();
        let report = self
            .guard
            .with_no_running_pipeline(&[TASKS_TABLE, SCOPES_TABLE], || async move { meta.purge_scope(&purge).await })
            .await?;
        tracing::info!(
            plugin,
            scope_id,
            raw_rows = report.raw_rows,
            tool_rows = report.tool_rows,
            domain_rows = report.domain_rows,
            "scope data purged"
        );
        Ok(report)
    }

    // ── scope configs ──────────────────────────────────────────

    pub async fn list_scope_configs(&self, plugin: &str) -> Result<Vec<ScopeConfig>> {
        self.scoped_plugin(plugin)?;
        self.meta.list_scope_configs(plugin).await
    }

    pub async fn get_scope_config(&self, plugin: &str, id: ScopeConfigId) -> Result<ScopeConfig> {
        self.scoped_plugin(plugin)?;
        self.meta
            .get_scope_config(plugin, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scope config {plugin}:{id}")))
    }

    #[tracing::instrument(level = "info", skip(self, input))]
    pub async fn save_scope_config(
        &self,
        plugin: &str,
        id: Option<ScopeConfigId>,
        input: ScopeConfigInput,
    ) -> Result<ScopeConfig> {
        let p = self.scoped_plugin(plugin)?;
        if !scope_source(p.as_ref())?.has_scope_configs() {
            return Err(Error::InvalidInput(format!("plugin {plugin} has no scope configs")));
        }
        if input.name.trim().is_empty() {
            return Err(Error::InvalidInput("scope config name is empty".to_string()));
        }
        if let Some(cid) = input.connection_id {
            self.get_connection(plugin, cid).await?;
        }
        let now = Utc::now();
        match id {
            Some(id) => {
                let mut cfg = self.get_scope_config(plugin, id).await?;
                cfg.name = input.name;
                cfg.connection_id = input.connection_id;
                cfg.entities = input.entities;
                cfg.settings = input.settings;
                cfg.updated_at = now;
                self.meta.update_scope_config(&cfg).await?;
                Ok(cfg)
            }
            None => {
                self.meta
                    .create_scope_config(&ScopeConfig {
                        id: ScopeConfigId(0),
                        plugin: plugin.to_string(),
                        connection_id: input.connection_id,
                        name: input.name,
                        entities: input.entities,
                        settings: input.settings,
                        created_at: now,
                        updated_at: now,
                    })
                    .await
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_scope_config(&self, plugin: &str, id: ScopeConfigId) -> Result<ScopeConfig> {
        let _lock = self.guard.lock_tables(&[SCOPES_TABLE]).await?;
        let cfg = self.get_scope_config(plugin, id).await?;
        let used = self.meta.count_scopes_with_config(plugin, id).await?;
        if used > 0 {
            return Err(Error::Conflict(format!(
                "scope config {id} is used by {used} scope(s)"
            )));
        }
        self.meta.delete_scope_config(plugin, id).await?;
        Ok(cfg)
    }

    /// NORMAL blueprints collecting the connection (or one of its scopes).
    async fn blueprint_refs(
        &self,
        plugin: &str,
        connection_id: ConnectionId,
        scope_id: Option<&str>,
    ) -> Result<DsRefs> {
        let mut refs = DsRefs::default();
        let mut page = 1;
        loop {
            let (batch, _) = self
                .meta
                .list_blueprints(&BlueprintQuery {
                    mode: Some(BlueprintMode::Normal),
                    pagination: Pagination { page, page_size: 200 },
                    ..Default::default()
                })
                .await?;
            if batch.is_empty() {
                break;
            }
            for bp in batch.iter().filter(|b| b.references(plugin, connection_id, scope_id)) {
                push_ref(&mut refs, bp);
            }
            page += 1;
        }
        Ok(refs)
    }
}

fn push_ref(refs: &mut DsRefs, bp: &Blueprint) {
    refs.blueprints.push(bp.name.clone());
    if let Some(project) = &bp.project_name {
        refs.projects.push(project.clone());
    }
}

fn scope_source(p: &dyn Plugin) -> Result<&dyn ScopeSource> {
    p.scope_source()
        .ok_or_else(|| Error::InvalidInput(format!("plugin {} has no scopes", p.name())))
}
