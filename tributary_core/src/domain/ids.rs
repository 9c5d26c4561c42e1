use crate::models::ConnectionId;
use std::fmt::Display;

/// Deterministic domain ids of the form `plugin:Type:connectionId:key[:key...]`.
///
/// Converters derive every domain id from the connection and the natural key
/// of the tool row, so re-running a conversion upserts instead of appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    prefix: String,
}

impl DomainIdGenerator {
    /// `entity_type` is the tool-layer type name, e.g. `GithubIssue`.
    pub fn new(plugin: &str, entity_type: &str) -> Self {
        Self {
            prefix: format!("{plugin}:{entity_type}"),
        }
    }

    pub fn generate(&self, connection_id: ConnectionId, key: impl Display) -> String {
        format!("{}:{connection_id}:{key}", self.prefix)
    }

    /// Id over a composite natural key.
    pub fn generate_composite(&self, connection_id: ConnectionId, keys: &[&dyn Display]) -> String {
        let mut id = format!("{}:{connection_id}", self.prefix);
        for k in keys {
            id.push(':');
            id.push_str(&k.to_string());
        }
        id
    }

    /// Split an id produced by this generator back into its connection and keys.
    pub fn parse(&self, id: &str) -> Option<(ConnectionId, Vec<String>)> {
        let rest = id.strip_prefix(&self.prefix)?.strip_prefix(':')?;
        let mut parts = rest.split(':');
        let conn = parts.next()?.parse().ok()?;
        let keys: Vec<String> = parts.map(str::to_string).collect();
        if keys.is_empty() {
            return None;
        }
        Some((conn, keys))
    }
}
