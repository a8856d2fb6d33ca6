//! Core data model (spec §3): jobs, permits, worker tasks/results.

use crate::cancel::CancelToken;
use crate::ids::{JobId, PermitId, WorkerHandleId, WorkerTaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Llm,
    WorkerTask,
    Shell,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityClass {
    Interactive,
    Batch,
    Background,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Priority {
    pub value: i32,
    pub class: PriorityClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLimits {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    #[serde(default)]
    pub cost_hint: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub trace_id: String,
    pub correlation_id: String,
}

/// A Job is immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub priority: Priority,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub limits: JobLimits,
    pub context: JobContext,
}

impl Job {
    /// The provider identity a circuit breaker counts failures against.
    /// For worker jobs this is the `workerKind` carried in the payload; for
    /// LLM jobs it's a model/provider string from the payload. Falls back
    /// to the job type name when the payload carries neither.
    pub fn infer_provider(&self) -> String {
        if let Some(kind) = self.payload.get("workerKind").and_then(|v| v.as_str()) {
            return kind.to_string();
        }
        if let Some(model) = self.payload.get("model").and_then(|v| v.as_str()) {
            return model.to_string();
        }
        if let Some(provider) = self.payload.get("provider").and_then(|v| v.as_str()) {
            return provider.to_string();
        }
        format!("{:?}", self.job_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermitRejectionReason {
    ConcurrencyLimit,
    RateLimit,
    BudgetExhausted,
    CircuitOpen,
    GlobalShed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitRejection {
    pub reason: PermitRejectionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PermitRejection {
    pub fn new(reason: PermitRejectionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokensGranted {
    pub concurrency: bool,
    pub rps: bool,
    pub cost: Option<f64>,
}

/// The serializable half of a Permit (no abort handle), as sent over IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializablePermit {
    pub permit_id: PermitId,
    pub job_id: JobId,
    pub deadline_at_ms: i64,
    pub attempt_index: u32,
    pub tokens_granted: TokensGranted,
    pub circuit_state_snapshot: HashMap<String, CircuitState>,
}

/// A live Permit. Not `Serialize` because it owns a `CancelToken`; use
/// `to_serializable()` to produce the wire form.
#[derive(Debug, Clone)]
pub struct Permit {
    pub permit_id: PermitId,
    pub job_id: JobId,
    pub deadline_at_ms: i64,
    pub attempt_index: u32,
    pub tokens_granted: TokensGranted,
    pub circuit_state_snapshot: HashMap<String, CircuitState>,
    pub abort: CancelToken,
    pub workspace_lock_token: Option<PermitId>,
}

impl Permit {
    pub fn to_serializable(&self) -> SerializablePermit {
        SerializablePermit {
            permit_id: self.permit_id,
            job_id: self.job_id,
            deadline_at_ms: self.deadline_at_ms,
            attempt_index: self.attempt_index,
            tokens_granted: self.tokens_granted.clone(),
            circuit_state_snapshot: self.circuit_state_snapshot.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerKind {
    Opencode,
    ClaudeCode,
    CodexCli,
    Custom,
}

impl WorkerKind {
    pub fn as_provider(&self) -> &'static str {
        match self {
            WorkerKind::Opencode => "OPENCODE",
            WorkerKind::ClaudeCode => "CLAUDE_CODE",
            WorkerKind::CodexCli => "CODEX_CLI",
            WorkerKind::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Read,
    Edit,
    RunTests,
    RunCommands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputMode {
    Batch,
    Stream,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Batch
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBudget {
    pub deadline_at_ms: i64,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub max_command_time_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub worker_task_id: WorkerTaskId,
    pub worker_kind: WorkerKind,
    pub workspace_ref: std::path::PathBuf,
    pub instructions: String,
    pub capabilities: Vec<Capability>,
    pub output_mode: OutputMode,
    pub budget: WorkerBudget,
    pub env: HashMap<String, String>,
    pub abort: CancelToken,
    /// Optional model/variant override passed to the worker CLI.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    RetryableTransient,
    RetryableRateLimit,
    RetryableNetwork,
    NonRetryable,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::RetryableTransient
                | ErrorClass::RetryableRateLimit
                | ErrorClass::RetryableNetwork
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Patch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCost {
    pub wall_time_ms: u64,
    #[serde(default)]
    pub tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub observations: Vec<Observation>,
    pub cost: WorkerCost,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl WorkerResult {
    pub fn succeeded(duration: Duration) -> Self {
        Self {
            status: WorkerStatus::Succeeded,
            artifacts: Vec::new(),
            observations: Vec::new(),
            cost: WorkerCost {
                wall_time_ms: duration.as_millis() as u64,
                tokens: None,
            },
            duration_ms: duration.as_millis() as u64,
            error_class: None,
        }
    }

    pub fn failed(duration: Duration, error_class: ErrorClass) -> Self {
        Self {
            status: WorkerStatus::Failed,
            artifacts: Vec::new(),
            observations: Vec::new(),
            cost: WorkerCost {
                wall_time_ms: duration.as_millis() as u64,
                tokens: None,
            },
            duration_ms: duration.as_millis() as u64,
            error_class: Some(error_class),
        }
    }

    pub fn cancelled(duration: Duration) -> Self {
        Self {
            status: WorkerStatus::Cancelled,
            artifacts: Vec::new(),
            observations: Vec::new(),
            cost: WorkerCost {
                wall_time_ms: duration.as_millis() as u64,
                tokens: None,
            },
            duration_ms: duration.as_millis() as u64,
            error_class: Some(ErrorClass::RetryableTransient),
        }
    }
}

/// A handle to a running worker process, returned by `WorkerAdapter::start_task`.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub handle_id: WorkerHandleId,
    pub worker_kind: WorkerKind,
    pub abort: CancelToken,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Stdout(String),
    Stderr(String),
    Progress(serde_json::Value),
    Patch { file_path: String, diff: String },
}
