//! Error taxonomy (spec §7; ambient expansion §10.2).
//!
//! Mirrors the teacher's split between a sentinel "already reported, just
//! set the exit code" marker and real propagating errors, generalized from
//! `NonSuccessfulExit`/`PipedExitCode` in the teacher's `error.rs`.

use crate::model::ErrorClass;
use std::fmt;

/// Signals that a human-readable error was already printed (to stderr, as
/// structured JSON) and the root handler should just translate this into a
/// process exit code without printing anything else.
#[derive(Debug)]
pub struct AlreadyReported(pub i32);

impl fmt::Display for AlreadyReported {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

impl std::error::Error for AlreadyReported {}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("reserved identifier: {0}")]
    ReservedId(String),
    #[error("invalid workflow definition: {0}")]
    InvalidWorkflow(String),
    #[error("invalid CLI argument: {0}")]
    BadArgument(String),
    #[error("cyclic dependency detected among steps: {0:?}")]
    CyclicDependency(Vec<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture stdio for {0}")]
    MissingStdio(String),
    #[error("process {pid} not found in live set")]
    NotFound { pid: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no adapter registered for worker kind {0:?}")]
    NoAdapter(crate::model::WorkerKind),
    #[error("workspace lock acquisition for {path} timed out after {timeout_ms}ms")]
    LockTimeout { path: String, timeout_ms: u64 },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, thiserror::Error)]
#[error("IPC response for requestId {request_id} timed out after {timeout_ms}ms")]
pub struct IpcTimeoutError {
    pub request_id: String,
    pub timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagementHookError {
    #[error("management hook timed out after {0}ms")]
    Timeout(u64),
    #[error("management hook aborted: {0}")]
    Aborted(String),
}

/// Top-level error wrapping every subsystem error, carrying the stable
/// `code` string spec §7 requires for the IPC `error` message and for
/// structured stderr output.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    IpcTimeout(#[from] IpcTimeoutError),
    #[error(transparent)]
    ManagementHook(#[from] ManagementHookError),
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Stable code string for IPC `error` messages / structured stderr logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::Process(_) => "process_error",
            CoreError::Worker(WorkerError::NoAdapter(_)) => "no_adapter",
            CoreError::Worker(WorkerError::LockTimeout { .. }) => "workspace_lock_timeout",
            CoreError::Worker(WorkerError::Process(_)) => "process_error",
            CoreError::IpcTimeout(_) => "ipc_timeout",
            CoreError::ManagementHook(_) => "management_hook_error",
            CoreError::Other(_) => "internal_error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Validation(_) => 1,
            _ => 1,
        }
    }
}

/// Classifies a non-zero worker exit per the substring heuristics in spec §4.6.
pub fn classify_worker_failure(exit_code: Option<i32>, stdout_tail: &str) -> ErrorClass {
    if matches!(exit_code, Some(137) | Some(143)) {
        return ErrorClass::RetryableTransient;
    }
    let lower = stdout_tail.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        return ErrorClass::RetryableRateLimit;
    }
    if lower.contains("econnrefused")
        || lower.contains("econnreset")
        || lower.contains("etimedout")
        || lower.contains("network")
        || lower.contains("socket hang up")
    {
        return ErrorClass::RetryableNetwork;
    }
    ErrorClass::NonRetryable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_signal_exit_as_retryable_transient() {
        assert_eq!(
            classify_worker_failure(Some(137), ""),
            ErrorClass::RetryableTransient
        );
        assert_eq!(
            classify_worker_failure(Some(143), ""),
            ErrorClass::RetryableTransient
        );
    }

    #[test]
    fn classifies_rate_limit_substring() {
        assert_eq!(
            classify_worker_failure(Some(1), "Error: 429 Too Many Requests"),
            ErrorClass::RetryableRateLimit
        );
    }

    #[test]
    fn classifies_network_substring() {
        assert_eq!(
            classify_worker_failure(Some(1), "connect ECONNREFUSED 127.0.0.1:443"),
            ErrorClass::RetryableNetwork
        );
    }

    #[test]
    fn falls_back_to_non_retryable() {
        assert_eq!(
            classify_worker_failure(Some(1), "unexpected panic in tool"),
            ErrorClass::NonRetryable
        );
    }
}
