use crate::models::{BlueprintId, ConnectionId, Pagination, SyncPolicy};
use crate::pipelines::models::PipelinePlan;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `cronConfig` value that disables scheduling.
pub const MANUAL_CRON: &str = "manual";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlueprintMode {
    /// Plan generated from connections and scopes through plugin plan makers.
    #[default]
    Normal,
    /// Plan supplied verbatim by the caller.
    Advanced,
}

/// Scope selected for collection under a blueprint connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintScope {
    pub scope_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintConnection {
    pub plugin_name: String,
    pub connection_id: ConnectionId,
    #[serde(default)]
    pub scopes: Vec<BlueprintScope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub id: BlueprintId,
    pub name: String,
    pub project_name: Option<String>,
    pub mode: BlueprintMode,
    /// Verbatim plan for ADVANCED blueprints.
    pub plan: PipelinePlan,
    pub before_plan: PipelinePlan,
    pub after_plan: PipelinePlan,
    pub connections: Vec<BlueprintConnection>,
    pub labels: Vec<String>,
    pub enable: bool,
    pub cron_config: String,
    pub is_manual: bool,
    #[serde(flatten)]
    pub sync_policy: SyncPolicy,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Blueprint {
    /// True when this blueprint collects the given connection (and scope, when supplied).
    pub fn references(&self, plugin: &str, connection_id: ConnectionId, scope_id: Option<&str>) -> bool {
        self.connections.iter().any(|c| {
            c.plugin_name == plugin
                && c.connection_id == connection_id
                && scope_id.is_none_or(|sid| c.scopes.iter().any(|s| s.scope_id == sid))
        })
    }

    /// Scheduled blueprints are enabled and not manual.
    pub fn is_scheduled(&self) -> bool {
        self.enable && !self.is_manual
    }
}

/// Creation payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlueprint {
    pub name: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub mode: BlueprintMode,
    #[serde(default)]
    pub plan: PipelinePlan,
    #[serde(default)]
    pub before_plan: PipelinePlan,
    #[serde(default)]
    pub after_plan: PipelinePlan,
    #[serde(default)]
    pub connections: Vec<BlueprintConnection>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub cron_config: Option<String>,
    #[serde(default, flatten)]
    pub sync_policy: SyncPolicy,
}

fn default_enable() -> bool {
    true
}

/// Partial update. `mode` is deliberately absent: it cannot change after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BlueprintPatch {
    pub name: Option<String>,
    pub project_name: Option<String>,
    pub plan: Option<PipelinePlan>,
    pub before_plan: Option<PipelinePlan>,
    pub after_plan: Option<PipelinePlan>,
    pub connections: Option<Vec<BlueprintConnection>>,
    pub labels: Option<Vec<String>>,
    pub enable: Option<bool>,
    pub cron_config: Option<String>,
    pub skip_on_fail: Option<bool>,
    pub full_sync: Option<bool>,
    pub skip_collectors: Option<bool>,
    pub time_after: Option<DateTime<Utc>>,
}

impl BlueprintPatch {
    /// Reject a patch body that tries to change the mode.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if value.get("mode").is_some() {
            return Err(Error::InvalidInput("mode is not updatable".to_string()));
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    pub fn apply(self, bp: &mut Blueprint) {
        if let Some(v) = self.name {
            bp.name = v;
        }
        if let Some(v) = self.project_name {
            bp.project_name = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = self.plan {
            bp.plan = v;
        }
        if let Some(v) = self.before_plan {
            bp.before_plan = v;
        }
        if let Some(v) = self.after_plan {
            bp.after_plan = v;
        }
        if let Some(v) = self.connections {
            bp.connections = v;
        }
        if let Some(v) = self.labels {
            bp.labels = v;
        }
        if let Some(v) = self.enable {
            bp.enable = v;
        }
        if let Some(v) = self.cron_config {
            bp.cron_config = v;
        }
        if let Some(v) = self.skip_on_fail {
            bp.sync_policy.skip_on_fail = v;
        }
        if let Some(v) = self.full_sync {
            bp.sync_policy.full_sync = v;
        }
        if let Some(v) = self.skip_collectors {
            bp.sync_policy.skip_collectors = v;
        }
        if let Some(v) = self.time_after {
            bp.sync_policy.time_after = Some(v);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlueprintQuery {
    pub enable: Option<bool>,
    pub is_manual: Option<bool>,
    pub mode: Option<BlueprintMode>,
    pub label: Option<String>,
    #[serde(flatten)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintList {
    pub blueprints: Vec<Blueprint>,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_rejects_mode() {
        let err = BlueprintPatch::from_json(json!({"mode": "ADVANCED"})).unwrap_err();
        assert!(err.to_string().contains("mode is not updatable"));
        let ok = BlueprintPatch::from_json(json!({"enable": false})).unwrap();
        assert_eq!(ok.enable, Some(false));
    }

    #[test]
    fn new_blueprint_defaults() {
        let nb: NewBlueprint = serde_json::from_value(json!({"name": "nightly"})).unwrap();
        assert!(nb.enable);
        assert_eq!(nb.mode, BlueprintMode::Normal);
        assert!(nb.cron_config.is_none());
    }
}
