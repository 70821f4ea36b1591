//! Registries of polymorphic job classes and task handlers.

pub mod handler;
pub mod job;

pub use handler::{HandlerRegistry, TaskHandler, DEFAULT_HANDLER_TIMEOUT};
pub use job::{FinalizeContext, JobClass, JobRegistry, StageSpec, StageTaskResult, TaskSpec};
