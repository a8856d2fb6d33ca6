//! Wire message types (spec §6 "IPC wire format").

use crate::model::{Job, PermitRejection, SerializablePermit, WorkerEvent, WorkerResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    pub request_id: String,
    pub job: Job,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelJob {
    pub request_id: String,
    pub job_id: crate::ids::JobId,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermit {
    pub request_id: String,
    pub job: Job,
    pub attempt_index: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQueueMetrics {
    pub request_id: String,
    pub queue_depth: u64,
    pub oldest_job_age_ms: u64,
    pub backlog_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ack {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "jobId")]
        job_id: crate::ids::JobId,
    },
    PermitGranted {
        #[serde(rename = "requestId")]
        request_id: String,
        permit: SerializablePermit,
    },
    PermitRejected {
        #[serde(rename = "requestId")]
        request_id: String,
        rejection: PermitRejection,
    },
    JobCompleted {
        #[serde(rename = "jobId")]
        job_id: crate::ids::JobId,
        outcome: WorkerResult,
    },
    /// Emitted per `WorkerEvent` while a `STREAM`-mode job runs (spec §4.8
    /// `delegateTaskWithEvents`).
    WorkerEvent {
        #[serde(rename = "jobId")]
        job_id: crate::ids::JobId,
        event: WorkerEvent,
    },
    JobCancelled {
        #[serde(rename = "jobId")]
        job_id: crate::ids::JobId,
        reason: String,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Escalation {
        event: crate::escalation::EscalationEvent,
    },
    Heartbeat {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

/// Generic inbound envelope used to read `type`/`requestId` before
/// dispatching to a typed handler (spec §4.12 dispatch rules).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub body: Value,
}
