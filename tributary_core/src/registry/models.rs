use crate::subtask::SubTask;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DOMAIN_TYPE_TICKET: &str = "TICKET";
pub const DOMAIN_TYPE_CICD: &str = "CICD";
pub const DOMAIN_TYPE_CODE: &str = "CODE";
pub const DOMAIN_TYPE_CROSS: &str = "CROSS";

/// A subtask as declared by a plugin, entry point included.
#[derive(Clone)]
pub struct SubTaskMeta {
    pub name: String,
    pub entry_point: Arc<dyn SubTask>,
    pub entry_point_name: String,
    pub required: bool,
    pub enabled_by_default: bool,
    pub description: String,
    pub domain_types: Vec<String>,
    pub dependency_tables: Vec<String>,
    pub product_tables: Vec<String>,
}

impl SubTaskMeta {
    pub fn new<T: SubTask + 'static>(name: impl Into<String>, entry_point: T) -> Self {
        let full = std::any::type_name::<T>();
        let entry_point_name = full.rsplit("::").next().unwrap_or(full).to_string();
        Self {
            name: name.into(),
            entry_point: Arc::new(entry_point),
            entry_point_name,
            required: false,
            enabled_by_default: true,
            description: String::new(),
            domain_types: Vec::new(),
            dependency_tables: Vec::new(),
            product_tables: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn domain_types(mut self, types: &[&str]) -> Self {
        self.domain_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, tables: &[&str]) -> Self {
        self.dependency_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn produces(mut self, tables: &[&str]) -> Self {
        self.product_tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn descriptor(&self) -> SubTaskDescriptor {
        SubTaskDescriptor {
            name: self.name.clone(),
            entry_point: self.entry_point_name.clone(),
            required: self.required,
            enabled_by_default: self.enabled_by_default,
            description: self.description.clone(),
            domain_types: self.domain_types.clone(),
            dependency_tables: self.dependency_tables.clone(),
            product_tables: self.product_tables.clone(),
        }
    }
}

impl std::fmt::Debug for SubTaskMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("entry_point", &self.entry_point_name)
            .field("required", &self.required)
            .field("enabled_by_default", &self.enabled_by_default)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a `SubTaskMeta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskDescriptor {
    pub name: String,
    pub entry_point: String,
    pub required: bool,
    pub enabled_by_default: bool,
    pub description: String,
    pub domain_types: Vec<String>,
    pub dependency_tables: Vec<String>,
    pub product_tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub has_scopes: bool,
    pub has_connections: bool,
    pub has_scope_configs: bool,
    pub produces_tables: bool,
    pub has_open_api: bool,
    pub has_plan_maker: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub subtask_metas: Vec<SubTaskDescriptor>,
    pub capabilities: Capabilities,
}
