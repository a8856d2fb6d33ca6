//! Step lifecycle state (spec §3 "Workflow DAG").

use crate::model::{ErrorClass, WorkerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Checking,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
    Incomplete,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::Cancelled
                | StepStatus::Skipped
                | StepStatus::Incomplete
        )
    }
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub error_class: Option<ErrorClass>,
    pub iterations: u32,
    pub result: Option<WorkerResult>,
}

impl StepOutcome {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            error_class: None,
            iterations: 0,
            result: None,
        }
    }
}
