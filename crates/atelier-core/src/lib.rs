mod runtime;

pub mod api;
pub mod artifact;
pub mod engine;

pub use runtime::runner::{CompletedTask, RunnerConfig, TaskRunner};
pub use runtime::storage::TaskStore;
pub use runtime::types::{
    Artifact, GenerationRequest, RuntimeError, Task, TaskFailure, TaskId, TaskState, TaskStatus,
};
