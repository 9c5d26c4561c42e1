use crate::models::{ConnectionId, ScopeConfigId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conflict report naming the blueprints and projects that block a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsRefs {
    pub blueprints: Vec<String>,
    pub projects: Vec<String>,
}

impl DsRefs {
    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty() && self.projects.is_empty()
    }
}

/// Credential and endpoint for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub plugin: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Overrides the engine-wide request budget.
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Copy safe to return from the API.
    pub fn sanitized(&self) -> Self {
        let mut c = self.clone();
        c.token = c.token.as_ref().map(|_| "********".to_string());
        c
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInput {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
}

impl ConnectionInput {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("connection name is empty".to_string()));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(Error::InvalidInput(format!(
                "endpoint must be an http(s) url: {}",
                self.endpoint
            )));
        }
        if self.rate_limit_per_hour == Some(0) {
            return Err(Error::InvalidInput("rateLimitPerHour must be > 0".to_string()));
        }
        Ok(())
    }
}

/// One collectible unit bound to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub plugin: String,
    pub connection_id: ConnectionId,
    /// Natural key within the connection.
    pub scope_id: String,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub scope_config_id: Option<ScopeConfigId>,
    /// Plugin-specific attributes.
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInput {
    pub scope_id: String,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub scope_config_id: Option<ScopeConfigId>,
    #[serde(default)]
    pub data: Value,
}

/// Compile-time view of a scope: every scope kind declares its keys explicitly.
pub trait ScopeLike {
    fn scope_id(&self) -> &str;
    fn scope_name(&self) -> &str;
    fn scope_full_name(&self) -> &str {
        self.scope_name()
    }
    fn connection_id(&self) -> ConnectionId;
    fn scope_config_id(&self) -> Option<ScopeConfigId>;
}

impl ScopeLike for Scope {
    fn scope_id(&self) -> &str {
        &self.scope_id
    }

    fn scope_name(&self) -> &str {
        &self.name
    }

    fn scope_full_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.name)
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn scope_config_id(&self) -> Option<ScopeConfigId> {
        self.scope_config_id
    }
}

/// Reusable transformation settings attached to scopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConfig {
    pub id: ScopeConfigId,
    pub plugin: String,
    pub connection_id: Option<ConnectionId>,
    pub name: String,
    /// Domain types to produce; empty means all.
    pub entities: Vec<String>,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConfigInput {
    pub name: String,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub settings: Value,
}

/// Result of a scope or connection delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub raw_rows: u64,
    pub tool_rows: u64,
    pub domain_rows: u64,
    pub collector_states: u64,
    pub scope_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_input_validation() {
        let mut c = ConnectionInput {
            name: "gh".into(),
            endpoint: "https://api.github.com".into(),
            ..Default::default()
        };
        assert!(c.validate().is_ok());
        c.endpoint = "ftp://x".into();
        assert!(c.validate().is_err());
        c.endpoint = "http://x".into();
        c.rate_limit_per_hour = Some(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn sanitized_masks_token() {
        let now = Utc::now();
        let c = Connection {
            id: ConnectionId(1),
            plugin: "github".into(),
            name: "gh".into(),
            endpoint: "https://api.github.com".into(),
            token: Some("secret".into()),
            proxy: None,
            rate_limit_per_hour: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(c.sanitized().token.as_deref(), Some("********"));
    }
}
