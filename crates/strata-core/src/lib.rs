//! Core orchestration engine for the strata geospatial ETL platform.
//!
//! Durably executes multi-stage jobs decomposed into tasks: a job
//! controller fans each stage out into task rows and messages, stateless
//! workers execute registered handlers, the last completing task of a
//! stage advances or finalizes the job, and a periodic janitor reconciles
//! everything message loss and process death can leave behind.

pub mod bus;
pub mod completion;
pub mod controller;
pub mod engine;
pub mod error;
pub mod ids;
pub mod janitor;
pub mod registry;
pub mod results;
pub mod submit;
pub mod worker;

pub use bus::{JobQueueMessage, MessageBus, PgBus, TaskQueueMessage, JOBS_QUEUE, TASKS_QUEUE};
pub use completion::StageDecision;
pub use engine::{Engine, EngineConfig};
pub use error::{InvalidParameters, SubmitError};
pub use janitor::JanitorConfig;
pub use registry::{
    FinalizeContext, HandlerRegistry, JobClass, JobRegistry, StageSpec, StageTaskResult,
    TaskHandler, TaskSpec,
};
pub use submit::{submit, SubmitReceipt};
