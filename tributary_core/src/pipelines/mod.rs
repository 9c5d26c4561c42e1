//! Pipeline execution: plan expansion, stage barriers, status aggregation,
//! cancel/rerun and the background queue.

pub mod engine;
pub mod models;
pub mod queue;
pub mod status;

pub use engine::PipelineOrchestrator;
pub use models::{
    NewPipeline, NewTask, Pipeline, PipelineList, PipelinePlan, PipelineQuery, PipelineStage, PipelineTask,
    SubTaskRecord, Task, TaskProgress,
};
pub use queue::PipelineQueue;
pub use status::{compute_pipeline_status, latest_tasks};
