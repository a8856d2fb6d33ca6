//! IPC server (spec §4.12, §6): binds `IpcProtocol` handlers to the
//! `CoreRuntime` subsystems for `serve` mode.

use crate::backpressure::LoadMetrics;
use crate::cancel::{CancelReason, CancelToken};
use crate::gateway::DelegateOptions;
use crate::ids::{JobId, PermitId, WorkerTaskId};
use crate::ipc::messages::{CancelJob, OutboundMessage, ReportQueueMetrics, RequestPermit, SubmitJob};
use crate::ipc::protocol::IpcProtocol;
use crate::model::{Capability, OutputMode, WorkerBudget, WorkerKind, WorkerTask};
use crate::runtime::CoreRuntime;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// The shape a `submitJob` job's payload must carry for this core to turn
/// it into a dispatchable `WorkerTask` (spec §6 does not pin this down
/// beyond "job"; this is the convention `run_one_shot` also produces via
/// `Job::infer_provider`'s `workerKind` field).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerTaskPayload {
    worker_kind: WorkerKind,
    workspace_ref: PathBuf,
    instructions: String,
    #[serde(default)]
    capabilities: Vec<Capability>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    #[serde(default)]
    output_mode: OutputMode,
}

struct ActiveJob {
    permit_id: PermitId,
    abort: CancelToken,
}

fn error_frame(code: &str, message: impl Into<String>, request_id: Option<String>) -> serde_json::Value {
    serde_json::to_value(OutboundMessage::Error {
        code: code.to_string(),
        message: message.into(),
        request_id,
    })
    .expect("OutboundMessage always serializes")
}

pub struct IpcServer {
    runtime: Arc<CoreRuntime>,
    protocol: Arc<IpcProtocol>,
    active_jobs: Arc<DashMap<JobId, ActiveJob>>,
}

impl IpcServer {
    pub fn new<R, W>(runtime: Arc<CoreRuntime>, reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let protocol = Arc::new(IpcProtocol::new(reader, writer));
        let server = Self {
            runtime,
            protocol,
            active_jobs: Arc::new(DashMap::new()),
        };
        server.register_handlers();
        server.register_escalation_forwarding();
        server
    }

    fn send(&self, msg: OutboundMessage) {
        match serde_json::to_value(&msg) {
            Ok(frame) => self.protocol.send(frame),
            Err(e) => warn!(error = %e, "failed to serialize outbound message"),
        }
    }

    fn register_handlers(&self) {
        self.register_submit_job();
        self.register_cancel_job();
        self.register_request_permit();
        self.register_report_queue_metrics();
    }

    fn register_submit_job(&self) {
        let runtime = self.runtime.clone();
        let protocol = self.protocol.clone();
        let active_jobs = self.active_jobs.clone();
        self.protocol.register_handler(
            "submit_job",
            Box::new(move |frame| {
                let runtime = runtime.clone();
                let protocol = protocol.clone();
                let active_jobs = active_jobs.clone();
                let msg: SubmitJob = match serde_json::from_value(frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed submit_job frame");
                        return;
                    }
                };
                tokio::spawn(async move { handle_submit_job(runtime, protocol, active_jobs, msg).await });
            }),
        );
    }

    fn register_cancel_job(&self) {
        let runtime = self.runtime.clone();
        let protocol = self.protocol.clone();
        let active_jobs = self.active_jobs.clone();
        self.protocol.register_handler(
            "cancel_job",
            Box::new(move |frame| {
                let msg: CancelJob = match serde_json::from_value(frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed cancel_job frame");
                        return;
                    }
                };
                let Some((_, active)) = active_jobs.remove(&msg.job_id) else {
                    protocol.send(error_frame(
                        "unknown_job",
                        format!("no active job {}", msg.job_id),
                        Some(msg.request_id),
                    ));
                    return;
                };
                runtime
                    .permit_gate
                    .revoke_permit(active.permit_id, &active.abort, CancelReason::UserCancel);
                let frame = serde_json::to_value(OutboundMessage::JobCancelled {
                    job_id: msg.job_id,
                    reason: msg.reason,
                    request_id: Some(msg.request_id),
                })
                .expect("OutboundMessage always serializes");
                protocol.send(frame);
            }),
        );
    }

    fn register_request_permit(&self) {
        let runtime = self.runtime.clone();
        let protocol = self.protocol.clone();
        self.protocol.register_handler(
            "request_permit",
            Box::new(move |frame| {
                let msg: RequestPermit = match serde_json::from_value(frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed request_permit frame");
                        return;
                    }
                };
                // A standalone admission-feasibility check: no worker task
                // follows, so the permit is released immediately rather
                // than held (the wire protocol has no release message).
                let out = match runtime.permit_gate.request_permit(&msg.job, msg.attempt_index) {
                    Ok(permit) => {
                        let serializable = permit.to_serializable();
                        runtime.permit_gate.complete_permit(permit.permit_id);
                        OutboundMessage::PermitGranted {
                            request_id: msg.request_id,
                            permit: serializable,
                        }
                    }
                    Err(rejection) => OutboundMessage::PermitRejected {
                        request_id: msg.request_id,
                        rejection,
                    },
                };
                protocol.send(serde_json::to_value(&out).expect("OutboundMessage always serializes"));
            }),
        );
    }

    fn register_report_queue_metrics(&self) {
        let runtime = self.runtime.clone();
        self.protocol.register_handler(
            "report_queue_metrics",
            Box::new(move |frame| {
                let msg: ReportQueueMetrics = match serde_json::from_value(frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed report_queue_metrics frame");
                        return;
                    }
                };
                runtime.backpressure.update_metrics(LoadMetrics {
                    active_permits: runtime.permit_gate.active_count() as u64,
                    queue_depth: msg.queue_depth,
                    avg_latency_ms: msg.oldest_job_age_ms as f64,
                });
            }),
        );
    }

    fn register_escalation_forwarding(&self) {
        let protocol = self.protocol.clone();
        self.runtime.escalation.on_escalation(Box::new(move |event| {
            let frame = serde_json::to_value(OutboundMessage::Escalation { event: event.clone() })
                .expect("OutboundMessage always serializes");
            protocol.send(frame);
        }));
    }

    /// Runs the server until `shutdown` fires: periodically evaluates
    /// escalation state and emits heartbeats, then stops the transport.
    pub async fn run(&self, shutdown: CancelToken) {
        let keepalive = self.runtime.config.ipc.keepalive;
        let keepalive_interval = self.runtime.config.ipc.keepalive_interval;
        let runtime = self.runtime.clone();
        let protocol = self.protocol.clone();
        let shutdown_for_ticker = shutdown.clone();

        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(keepalive_interval);
            loop {
                tokio::select! {
                    _ = shutdown_for_ticker.cancelled() => break,
                    _ = interval.tick() => {
                        runtime.escalation.evaluate();
                        if keepalive {
                            let frame = serde_json::to_value(OutboundMessage::Heartbeat {
                                timestamp: chrono::Utc::now().timestamp_millis(),
                            })
                            .expect("OutboundMessage always serializes");
                            protocol.send(frame);
                        }
                    }
                }
            }
        });

        shutdown.cancelled().await;
        ticker.abort();
        self.protocol.stop().await;
    }
}

async fn handle_submit_job(
    runtime: Arc<CoreRuntime>,
    protocol: Arc<IpcProtocol>,
    active_jobs: Arc<DashMap<JobId, ActiveJob>>,
    msg: SubmitJob,
) {
    let job_id = msg.job.job_id;

    let permit = match runtime.permit_gate.request_permit(&msg.job, 0) {
        Ok(permit) => permit,
        Err(rejection) => {
            protocol.send(
                serde_json::to_value(OutboundMessage::PermitRejected {
                    request_id: msg.request_id,
                    rejection,
                })
                .expect("OutboundMessage always serializes"),
            );
            return;
        }
    };

    protocol.send(
        serde_json::to_value(OutboundMessage::Ack {
            request_id: msg.request_id.clone(),
            job_id,
        })
        .expect("OutboundMessage always serializes"),
    );

    let payload: WorkerTaskPayload = match serde_json::from_value(msg.job.payload.clone()) {
        Ok(p) => p,
        Err(e) => {
            runtime.permit_gate.complete_permit(permit.permit_id);
            protocol.send(error_frame(
                "invalid_job_payload",
                format!("job payload is not a worker task: {e}"),
                Some(msg.request_id),
            ));
            return;
        }
    };

    active_jobs.insert(
        job_id,
        ActiveJob {
            permit_id: permit.permit_id,
            abort: permit.abort.clone(),
        },
    );

    let output_mode = payload.output_mode;
    let task = WorkerTask {
        worker_task_id: WorkerTaskId::new(),
        worker_kind: payload.worker_kind,
        workspace_ref: payload.workspace_ref,
        instructions: payload.instructions,
        capabilities: payload.capabilities,
        output_mode,
        budget: WorkerBudget {
            deadline_at_ms: permit.deadline_at_ms,
            max_steps: None,
            max_command_time_ms: None,
        },
        env: payload.env,
        abort: permit.abort.clone(),
        model: payload.model,
    };

    let delegate_opts = DelegateOptions {
        acquire_lock_timeout_ms: runtime.config.acquire_lock_timeout_ms,
    };

    let result = if output_mode == OutputMode::Stream {
        let event_protocol = protocol.clone();
        runtime
            .gateway
            .delegate_task_with_events(task, &permit, delegate_opts, move |event| {
                event_protocol.send(
                    serde_json::to_value(OutboundMessage::WorkerEvent { job_id, event })
                        .expect("OutboundMessage always serializes"),
                );
            })
            .await
    } else {
        runtime.gateway.delegate_task(task, &permit, delegate_opts).await
    };

    active_jobs.remove(&job_id);
    runtime.permit_gate.complete_permit(permit.permit_id);

    let provider = msg.job.infer_provider();
    match result {
        Ok(outcome) => {
            if outcome.status == crate::model::WorkerStatus::Succeeded {
                runtime.circuit_breakers.record_success(&provider);
            } else {
                runtime.circuit_breakers.record_failure(&provider);
            }
            protocol.send(
                serde_json::to_value(OutboundMessage::JobCompleted { job_id, outcome })
                    .expect("OutboundMessage always serializes"),
            );
        }
        Err(e) => {
            runtime.circuit_breakers.record_failure(&provider);
            protocol.send(error_frame(e.to_string().as_str(), e.to_string(), Some(msg.request_id)));
        }
    }
}
