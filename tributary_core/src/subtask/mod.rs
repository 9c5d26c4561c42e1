//! Subtask contract plus the extract, convert and enrich helpers plugins build on.

pub mod batch;
pub mod context;
pub mod converter;
pub mod enricher;
pub mod extractor;

use crate::Result;
use async_trait::async_trait;

pub use batch::{BatchSaver, OutputRow};
pub use context::{SubTaskContext, TaskContext, TaskData};
pub use converter::DataConverter;
pub use enricher::DataEnricher;
pub use extractor::ApiExtractor;

/// One collect, extract, convert or enrich step of a plugin.
#[async_trait]
pub trait SubTask: Send + Sync {
    async fn execute(&self, ctx: &SubTaskContext) -> Result<()>;
}
