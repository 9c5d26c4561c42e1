//! Plugin registry: subtask descriptors and optional capabilities per plugin.

pub mod models;
pub mod plugins;
pub mod traits;

pub use models::{Capabilities, PluginInfo, SubTaskDescriptor, SubTaskMeta};
pub use plugins::{PluginRegistry, decode_options};
pub use traits::{OpenApiProvider, PlanContext, PlanMaker, PlanScope, Plugin, ScopeSource, TableProducer};
