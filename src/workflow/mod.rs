//! Workflow DAG execution (spec §4.11, §3, §6).

pub mod dag;
pub mod executor;
pub mod persist;
pub mod step;

pub use dag::{CompletionCheckConfig, InputSpec, OnFailure, OnIterationsExhausted, StepDef, WorkflowDef};
pub use executor::{WorkflowExecutor, WorkflowOutcome, WorkflowStatus};
pub use persist::WorkflowPersistence;
pub use step::{StepOutcome, StepStatus};
