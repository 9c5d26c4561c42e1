//! Source plugins compiled into the tributary binary.
//!
//! Each plugin lives behind a cargo feature of the same name.

#![forbid(unsafe_code)]

#[cfg(feature = "github")]
pub mod github;

use std::sync::Arc;
use tributary_core::{PluginRegistry, Result};

/// Register every plugin enabled at compile time.
#[tracing::instrument(level = "debug", skip_all)]
pub fn register_all(registry: &mut PluginRegistry) -> Result<()> {
    #[cfg(feature = "github")]
    registry.register(Arc::new(github::GithubPlugin::new()))?;
    tracing::debug!(plugins = ?registry.names(), "plugins registered");
    Ok(())
}

/// A registry holding every enabled plugin.
pub fn default_registry() -> Result<Arc<PluginRegistry>> {
    let mut registry = PluginRegistry::new();
    register_all(&mut registry)?;
    Ok(Arc::new(registry))
}

#[cfg(all(test, feature = "github"))]
mod tests {
    use super::*;

    #[test]
    fn github_is_registered_by_default() {
        let registry = default_registry().unwrap();
        assert!(registry.contains("github"));
        let info = registry.info("github").unwrap();
        assert!(info.capabilities.has_scopes);
        assert_eq!(info.subtask_metas.len(), 7);
    }
}
