pub mod task;

pub use task::{TaskFailure, TaskRunner, select_subtasks};
