//! Connections, scopes and scope configs, with reference-checked deletes.

pub mod models;
pub mod service;

pub use models::{
    Connection, ConnectionInput, DsRefs, PurgeReport, Scope, ScopeConfig, ScopeConfigInput, ScopeInput, ScopeLike,
};
pub use service::SourceService;
