use crate::registry::models::{PluginInfo, SubTaskMeta};
use crate::registry::traits::Plugin;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Compiled-in plugins by name. Built once at startup, then shared read-only.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "info", skip_all, fields(plugin = %plugin.name()))]
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(Error::InvalidInput(format!("invalid plugin name: {name:?}")));
        }
        if self.plugins.contains_key(&name) {
            return Err(Error::Conflict(format!("plugin {name} is already registered")));
        }
        validate_subtasks(&name, &plugin.subtask_metas())?;
        tracing::info!(subtasks = plugin.subtask_metas().len(), "plugin registered");
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("plugin {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn info(&self, name: &str) -> Result<PluginInfo> {
        Ok(plugin_info(self.get(name)?.as_ref()))
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins.values().map(|p| plugin_info(p.as_ref())).collect()
    }
}

fn plugin_info(p: &dyn Plugin) -> PluginInfo {
    PluginInfo {
        name: p.name().to_string(),
        description: p.description().to_string(),
        subtask_metas: p.subtask_metas().iter().map(SubTaskMeta::descriptor).collect(),
        capabilities: p.capabilities(),
    }
}

/// Subtask names must be unique, and no subtask may depend on a table that
/// only a later subtask produces.
fn validate_subtasks(plugin: &str, metas: &[SubTaskMeta]) -> Result<()> {
    let mut names = HashSet::new();
    for m in metas {
        if m.name.is_empty() {
            return Err(Error::InvalidInput(format!("plugin {plugin} has a subtask without a name")));
        }
        if !names.insert(m.name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "plugin {plugin} declares subtask {} twice",
                m.name
            )));
        }
    }

    let mut produced: HashSet<&str> = HashSet::new();
    for (i, m) in metas.iter().enumerate() {
        for dep in &m.dependency_tables {
            if produced.contains(dep.as_str()) {
                continue;
            }
            if let Some(later) = metas[i + 1..]
                .iter()
                .find(|l| l.product_tables.iter().any(|t| t == dep))
            {
                return Err(Error::InvalidInput(format!(
                    "plugin {plugin}: subtask {} depends on {dep}, which is produced by the later subtask {}",
                    m.name, later.name
                )));
            }
        }
        produced.extend(m.product_tables.iter().map(String::as_str));
    }
    Ok(())
}

/// Decode a task's options into the plugin's typed options.
pub fn decode_options<T: DeserializeOwned>(options: &Value) -> Result<T> {
    let v = match options {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(v).map_err(|e| Error::InvalidInput(format!("invalid options: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtask::{SubTask, SubTaskContext};
    use crate::test_support::FixturePlugin;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl SubTask for Noop {
        async fn execute(&self, _ctx: &SubTaskContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_describe() {
        let mut reg = PluginRegistry::new();
        reg.register(Arc::new(FixturePlugin::default())).unwrap();
        let info = reg.info("fixture").unwrap();
        assert_eq!(info.subtask_metas[0].name, "collectItems");
        assert!(info.capabilities.has_scopes);
        assert!(matches!(
            reg.register(Arc::new(FixturePlugin::default())),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(reg.get("jira"), Err(Error::NotFound(_))));
    }

    #[test]
    fn dependency_on_later_product_is_rejected() {
        let metas = vec![
            SubTaskMeta::new("extractItems", Noop).depends_on(&["_raw_x_items"]),
            SubTaskMeta::new("collectItems", Noop).produces(&["_raw_x_items"]),
        ];
        assert!(validate_subtasks("x", &metas).is_err());

        let ordered = vec![
            SubTaskMeta::new("collectItems", Noop).produces(&["_raw_x_items"]),
            SubTaskMeta::new("extractItems", Noop).depends_on(&["_raw_x_items"]),
        ];
        assert!(validate_subtasks("x", &ordered).is_ok());
        assert_eq!(ordered[0].entry_point_name, "Noop");
    }

    #[test]
    fn decode_options_rejects_missing_fields() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        #[allow(dead_code)]
        struct Opts {
            connection_id: u64,
            name: String,
        }
        let ok: Opts = decode_options(&json!({"connectionId": 1, "name": "a/b"})).unwrap();
        assert_eq!(ok.connection_id, 1);
        assert!(matches!(
            decode_options::<Opts>(&json!({"name": "a/b"})),
            Err(Error::InvalidInput(_))
        ));
    }
}
