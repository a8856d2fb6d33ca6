//! CoreRuntime: the composition root wiring every subsystem together
//! (spec §4, §7 "shutdown sequence").

use crate::backpressure::BackpressureController;
use crate::budget::ExecutionBudget;
use crate::cancel::CancelToken;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::daemon::{load_daemon_def, DaemonRunner};
use crate::error::CoreError;
use crate::escalation::{EscalationConfig, EscalationManager};
use crate::gateway::{DelegateOptions, WorkerDelegationGateway};
use crate::ids::{JobId, WorkerTaskId};
use crate::model::{
    Capability, Job, JobContext, JobLimits, JobType, OutputMode, Priority, PriorityClass,
    WorkerBudget, WorkerKind, WorkerResult, WorkerTask,
};
use crate::permit_gate::PermitGate;
use crate::process_manager::ProcessManager;
use crate::watchdog::{default_thresholds, Watchdog};
use crate::worker::{AdapterRegistry, CliWorkerAdapter};
use crate::workflow::{WorkflowDef, WorkflowExecutor, WorkflowOutcome};
use crate::workspace_lock::WorkspaceLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

fn default_adapter_registry(process_manager: Arc<ProcessManager>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(CliWorkerAdapter::new(
        WorkerKind::Opencode,
        "opencode",
        process_manager.clone(),
    )));
    registry.register(Arc::new(CliWorkerAdapter::new(
        WorkerKind::ClaudeCode,
        "claude",
        process_manager.clone(),
    )));
    registry.register(Arc::new(CliWorkerAdapter::new(
        WorkerKind::CodexCli,
        "codex",
        process_manager,
    )));
    // WorkerKind::Custom has no default binary; callers needing it must
    // register their own adapter before dispatching a CUSTOM job.
    registry
}

/// Options for a one-shot `run` invocation (spec §6 CLI surface).
pub struct RunOptions {
    pub worker_kind: WorkerKind,
    pub workspace: PathBuf,
    pub instructions: String,
    pub model: Option<String>,
    pub capabilities: Vec<Capability>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub cost_hint: Option<f64>,
}

pub struct CoreRuntime {
    pub config: Arc<Config>,
    pub budget: Arc<ExecutionBudget>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub backpressure: Arc<BackpressureController>,
    pub permit_gate: Arc<PermitGate>,
    pub process_manager: Arc<ProcessManager>,
    pub adapters: Arc<AdapterRegistry>,
    pub gateway: Arc<WorkerDelegationGateway>,
    pub workspace_lock: Arc<WorkspaceLock>,
    pub watchdog: Arc<Watchdog>,
    pub escalation: Arc<EscalationManager>,
    pub workflow_executor: Arc<WorkflowExecutor>,
}

impl CoreRuntime {
    pub fn new(config: Arc<Config>) -> Self {
        let budget = Arc::new(ExecutionBudget::new(&config.budget));
        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let backpressure = Arc::new(BackpressureController::new(config.backpressure.clone()));
        let permit_gate = Arc::new(PermitGate::new(
            backpressure.clone(),
            circuit_breakers.clone(),
            budget.clone(),
        ));
        let process_manager = Arc::new(ProcessManager::new());
        let adapters = Arc::new(default_adapter_registry(process_manager.clone()));
        let workspace_lock = Arc::new(WorkspaceLock::new());
        let gateway = Arc::new(WorkerDelegationGateway::new(
            adapters.clone(),
            workspace_lock.clone(),
        ));
        let watchdog = Arc::new(Watchdog::new(config.watchdog_interval, default_thresholds()));
        let escalation = Arc::new(EscalationManager::new(EscalationConfig::default()));
        let workflow_executor = Arc::new(WorkflowExecutor::new(
            permit_gate.clone(),
            gateway.clone(),
            process_manager.clone(),
        ));

        Self {
            config,
            budget,
            circuit_breakers,
            backpressure,
            permit_gate,
            process_manager,
            adapters,
            gateway,
            workspace_lock,
            watchdog,
            escalation,
            workflow_executor,
        }
    }

    /// Dispatches a single worker task outside of any workflow, for the
    /// `run` subcommand. Retries admission-layer rejections are the
    /// caller's concern; this method performs exactly one permit request.
    pub async fn run_one_shot(&self, opts: RunOptions) -> Result<WorkerResult, CoreError> {
        let job = Job {
            job_id: JobId::new(),
            job_type: JobType::WorkerTask,
            priority: Priority {
                value: 0,
                class: PriorityClass::Interactive,
            },
            payload: serde_json::json!({ "workerKind": opts.worker_kind.as_provider() }),
            limits: JobLimits {
                timeout_ms: opts.timeout_ms,
                max_attempts: opts.max_attempts,
                cost_hint: opts.cost_hint,
            },
            context: JobContext {
                trace_id: JobId::new().to_string(),
                correlation_id: "run".to_string(),
            },
        };

        let permit = self
            .permit_gate
            .request_permit(&job, 0)
            .map_err(|rejection| CoreError::Other(format!("{rejection:?}")))?;

        let task = WorkerTask {
            worker_task_id: WorkerTaskId::new(),
            worker_kind: opts.worker_kind,
            workspace_ref: opts.workspace,
            instructions: opts.instructions,
            capabilities: opts.capabilities,
            output_mode: OutputMode::Batch,
            budget: WorkerBudget {
                deadline_at_ms: permit.deadline_at_ms,
                max_steps: None,
                max_command_time_ms: None,
            },
            env: std::collections::HashMap::new(),
            abort: permit.abort.clone(),
            model: opts.model,
        };

        let result = self
            .gateway
            .delegate_task(task, &permit, DelegateOptions {
                acquire_lock_timeout_ms: self.config.acquire_lock_timeout_ms,
            })
            .await
            .map_err(CoreError::Worker)?;

        self.permit_gate.complete_permit(permit.permit_id);
        Ok(result)
    }

    pub async fn run_workflow_file(
        &self,
        path: &Path,
        workspace_root: &Path,
        context_dir: &Path,
    ) -> Result<WorkflowOutcome, CoreError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Other(format!("reading {}: {e}", path.display())))?;
        let def = WorkflowDef::from_yaml(&contents)?;
        let outcome = self.workflow_executor.run(def, workspace_root, context_dir).await?;
        Ok(outcome)
    }

    pub async fn run_daemon_file(
        &self,
        path: &Path,
        workspace_root: &Path,
        context_root: &Path,
        cancel: CancelToken,
    ) -> Result<(), CoreError> {
        let def = load_daemon_def(path)?;
        let runner = DaemonRunner::new(
            def,
            self.workflow_executor.clone(),
            workspace_root.to_path_buf(),
            context_root.to_path_buf(),
        );
        runner.run(cancel).await;
        Ok(())
    }

    pub fn start_watchdog(&self) {
        self.watchdog.start();
    }

    /// Single shutdown sequence for uncaught failures at the process root
    /// (spec §7): cancel all permits, cancel all workers, let callers flush
    /// IPC themselves before exiting.
    pub async fn shutdown(&self) {
        info!("shutdown sequence starting");
        self.permit_gate.dispose();
        self.gateway.cancel_all().await;
        self.process_manager.kill_all().await;
        self.watchdog.stop();
    }
}
