//! WorkflowExecutor (spec §4.11 DAG half): DAG scheduler with retries,
//! completion-check loops, stall detection, and artifact hand-off.

use crate::cancel::{CancelReason, CancelToken};
use crate::gateway::{DelegateOptions, WorkerDelegationGateway};
use crate::ids::JobId;
use crate::model::{
    Capability, ErrorClass, Job, JobContext, JobLimits, JobType, OutputMode, Priority,
    PriorityClass, WorkerBudget, WorkerTask,
};
use crate::permit_gate::PermitGate;
use crate::process_manager::{ProcessManager, SpawnOptions};
use crate::sentinel::{
    ActivityKey, ActivitySource, ActivityTracker, CommandProbeRunner, NoOutputWatcher,
    NoOutputWatcherConfig, NoProgressWatcher, NoProgressWatcherConfig, SentinelAction,
    SentinelGuard,
};
use crate::workflow::dag::{CompletionCheckConfig, OnFailure, OnIterationsExhausted, StepDef, WorkflowDef};
use crate::workflow::persist::WorkflowPersistence;
use crate::workflow::step::{StepOutcome, StepStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

pub struct WorkflowOutcome {
    pub status: WorkflowStatus,
    pub steps: HashMap<String, StepOutcome>,
}

static STEP_RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct WorkflowExecutor {
    permit_gate: Arc<PermitGate>,
    gateway: Arc<WorkerDelegationGateway>,
    activity_tracker: Arc<ActivityTracker>,
    process_manager: Arc<ProcessManager>,
}

impl WorkflowExecutor {
    pub fn new(
        permit_gate: Arc<PermitGate>,
        gateway: Arc<WorkerDelegationGateway>,
        process_manager: Arc<ProcessManager>,
    ) -> Self {
        Self {
            permit_gate,
            gateway,
            activity_tracker: Arc::new(ActivityTracker::new()),
            process_manager,
        }
    }

    pub async fn run(
        &self,
        def: WorkflowDef,
        workspace_root: &Path,
        context_dir: &Path,
    ) -> Result<WorkflowOutcome, crate::error::ValidationError> {
        def.validate()?;
        let persistence = WorkflowPersistence::new(context_dir);
        let _ = persistence.write_workflow_meta(&def, "RUNNING");

        let workflow_abort = CancelToken::new();
        let outcomes: Arc<Mutex<HashMap<String, StepOutcome>>> = Arc::new(Mutex::new(
            def.steps
                .iter()
                .map(|s| (s.step_id.clone(), StepOutcome::pending()))
                .collect(),
        ));

        let timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let timer_abort = workflow_abort.clone();
        let timer_flag = timed_out.clone();
        let timeout = def.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_flag.store(true, Ordering::SeqCst);
            timer_abort.cancel(CancelReason::DeadlineExpired).await;
        });

        let semaphore = Arc::new(Semaphore::new(def.concurrency.unwrap_or(usize::MAX).max(1)));
        let mut started: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut join_set = tokio::task::JoinSet::new();

        loop {
            if workflow_abort.is_cancelled() {
                break;
            }

            let outcomes_snapshot = outcomes.lock().await.clone();
            if outcomes_snapshot.values().all(|o| o.status.is_terminal()) {
                break;
            }

            let ready: Vec<StepDef> = def
                .steps
                .iter()
                .filter(|s| !started.contains(&s.step_id))
                .filter(|s| outcomes_snapshot[&s.step_id].status == StepStatus::Pending)
                .filter(|s| {
                    s.depends_on.iter().all(|dep_id| {
                        let dep_status = outcomes_snapshot.get(dep_id).map(|o| o.status);
                        let dep_def = def.step(dep_id);
                        matches!(dep_status, Some(StepStatus::Succeeded) | Some(StepStatus::Incomplete))
                            || (dep_status == Some(StepStatus::Failed)
                                && dep_def.map(|d| d.on_failure == OnFailure::Continue).unwrap_or(false))
                    })
                })
                .cloned()
                .collect();

            if ready.is_empty() && join_set.is_empty() {
                // Nothing ready and nothing running: remaining pending
                // steps can never become ready (their deps are stuck in a
                // non-terminal or blocking state) — treat as skipped.
                let mut guard = outcomes.lock().await;
                for (id, outcome) in guard.iter_mut() {
                    if outcome.status == StepStatus::Pending && !started.contains(id) {
                        outcome.status = StepStatus::Skipped;
                    }
                }
                break;
            }

            for step in ready {
                started.insert(step.step_id.clone());
                let permit_semaphore = semaphore.clone();
                let permit_gate = self.permit_gate.clone();
                let gateway = self.gateway.clone();
                let activity_tracker = self.activity_tracker.clone();
                let process_manager = self.process_manager.clone();
                let outcomes = outcomes.clone();
                let workflow_abort = workflow_abort.child();
                let def_steps_by_id: HashMap<String, StepDef> =
                    def.steps.iter().map(|s| (s.step_id.clone(), s.clone())).collect();
                let workspace_root = workspace_root.to_path_buf();
                let context_dir = context_dir.to_path_buf();

                join_set.spawn(async move {
                    let _permit = permit_semaphore.acquire_owned().await.ok();
                    run_step(
                        step,
                        def_steps_by_id,
                        permit_gate,
                        gateway,
                        activity_tracker,
                        process_manager,
                        workflow_abort,
                        workspace_root,
                        context_dir,
                        outcomes,
                    )
                    .await;
                });
            }

            if let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    warn!(error = %e, "workflow step task panicked");
                }
            }
        }

        // Drain remaining tasks.
        while join_set.join_next().await.is_some() {}
        timer.abort();

        let mut final_outcomes = outcomes.lock().await.clone();
        let status = if timed_out.load(Ordering::SeqCst) {
            for outcome in final_outcomes.values_mut() {
                match outcome.status {
                    StepStatus::Running | StepStatus::Checking => outcome.status = StepStatus::Cancelled,
                    StepStatus::Pending | StepStatus::Ready => outcome.status = StepStatus::Skipped,
                    _ => {}
                }
            }
            WorkflowStatus::TimedOut
        } else if final_outcomes.values().any(|o| o.status == StepStatus::Failed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Succeeded
        };

        let _ = persistence.write_workflow_meta(&def, workflow_status_name(status));
        for (step_id, outcome) in &final_outcomes {
            let worker_kind = def
                .step(step_id)
                .map(|s| s.worker_kind.as_provider())
                .unwrap_or("UNKNOWN");
            let _ = persistence.write_step_meta(step_id, worker_kind, outcome);
        }

        info!(workflow_id = %def.workflow_id, ?status, "workflow run finished");

        Ok(WorkflowOutcome {
            status,
            steps: final_outcomes,
        })
    }
}

fn workflow_status_name(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Running => "RUNNING",
        WorkflowStatus::Succeeded => "SUCCEEDED",
        WorkflowStatus::Failed => "FAILED",
        WorkflowStatus::TimedOut => "TIMED_OUT",
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_step(
    step: StepDef,
    all_steps: HashMap<String, StepDef>,
    permit_gate: Arc<PermitGate>,
    gateway: Arc<WorkerDelegationGateway>,
    activity_tracker: Arc<ActivityTracker>,
    process_manager: Arc<ProcessManager>,
    step_abort: CancelToken,
    workspace_root: PathBuf,
    context_dir: PathBuf,
    outcomes: Arc<Mutex<HashMap<String, StepOutcome>>>,
) {
    let persistence = WorkflowPersistence::new(&context_dir);
    let step_workspace = workspace_root.join(&step.step_id);
    let _ = std::fs::create_dir_all(&step_workspace);

    // Materialize workspace inputs (spec §4.11 step 1).
    for input in &step.inputs {
        let _ = persistence.materialize_input(&input.from, &input.artifact, &step_workspace, input.target_name());
    }

    let step_run_id = STEP_RUN_COUNTER.fetch_add(1, Ordering::SeqCst);
    let activity_key = ActivityKey {
        step_id: step_run_id,
        iteration: 0,
    };

    let mut iteration = 0u32;
    let mut attempt = 0u32;
    let mut last_outcome = StepOutcome::pending();
    last_outcome.status = StepStatus::Running;

    'iterations: loop {
        let guard = Arc::new(SentinelGuard::new(activity_key, activity_tracker.clone(), step_abort.clone()));
        guard.start_no_output(
            NoOutputWatcher::new(NoOutputWatcherConfig {
                poll_interval: Duration::from_millis(500).min(Duration::from_millis(step.timeout_ms.max(1))),
                no_output_timeout: Duration::from_millis(step.timeout_ms),
                activity_source: ActivitySource::AnyEvent,
            }),
            SentinelAction::Interrupt,
        );
        if let Some(probe_cfg) = &step.probe {
            let probe_runner = Arc::new(CommandProbeRunner::new(
                process_manager.clone(),
                probe_cfg.command.clone(),
                probe_cfg.args.clone(),
                step_workspace.clone(),
                probe_cfg.timeout_ms,
            ));
            guard.start_no_progress(NoProgressWatcher::new(
                NoProgressWatcherConfig {
                    interval: probe_cfg.interval,
                    stall_threshold: probe_cfg.stall_threshold,
                    probe_error_threshold: probe_cfg.probe_error_threshold,
                    on_probe_error: probe_cfg.on_probe_error,
                    on_terminal_action: probe_cfg.action,
                },
                probe_runner,
            ));
        }

        let job = synthesize_job(&step);
        let permit = match permit_gate.request_permit(&job, attempt) {
            Ok(p) => p,
            Err(rejection) => {
                warn!(step_id = %step.step_id, ?rejection, "step admission rejected");
                last_outcome.status = StepStatus::Failed;
                last_outcome.error_class = Some(ErrorClass::NonRetryable);
                guard.stop();
                break 'iterations;
            }
        };

        // Cascade step-level cancellation (workflow timeout, sentinel
        // interrupt) down to the permit's own abort handle, since the
        // permit gate mints a fresh token rather than a child of ours.
        let bridge_step_abort = step_abort.clone();
        let bridge_permit_abort = permit.abort.clone();
        let abort_bridge = tokio::spawn(async move {
            bridge_step_abort.cancelled().await;
            bridge_permit_abort.cancel(CancelReason::ParentCancelled).await;
        });

        let task = WorkerTask {
            worker_task_id: crate::ids::WorkerTaskId::new(),
            worker_kind: step.worker_kind,
            workspace_ref: step_workspace.clone(),
            instructions: step.instructions.clone(),
            capabilities: step.capabilities.clone(),
            output_mode: OutputMode::Batch,
            budget: WorkerBudget {
                deadline_at_ms: permit.deadline_at_ms,
                max_steps: None,
                max_command_time_ms: None,
            },
            env: Default::default(),
            abort: permit.abort.clone(),
            model: None,
        };

        let result = gateway
            .delegate_task(task, &permit, DelegateOptions::default())
            .await;
        permit_gate.complete_permit(permit.permit_id);
        abort_bridge.abort();
        guard.stop();

        let worker_result = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(step_id = %step.step_id, error = %e, "worker delegation failed");
                last_outcome.status = StepStatus::Failed;
                last_outcome.error_class = Some(ErrorClass::NonRetryable);
                break 'iterations;
            }
        };

        last_outcome.result = Some(worker_result.clone());
        last_outcome.iterations = iteration + 1;

        match worker_result.status {
            crate::model::WorkerStatus::Succeeded => {
                let check_passed = match &step.completion_check {
                    Some(check) => {
                        last_outcome.status = StepStatus::Checking;
                        run_completion_check(&process_manager, check, &step_workspace, &permit.abort).await
                    }
                    None => true,
                };

                if check_passed {
                    last_outcome.status = StepStatus::Succeeded;
                    for artifact in &step.output_artifacts {
                        let source = step_workspace.join(artifact);
                        let _ = persistence.collect_output(&step.step_id, artifact, &source);
                    }
                    break 'iterations;
                }

                // Check reported incomplete: loop back to RUNNING up to
                // `max_iterations` (spec §3, §4.11 step 5).
                let check = step.completion_check.as_ref().expect("check_passed is only false when Some");
                iteration += 1;
                if iteration >= check.max_iterations {
                    last_outcome.status = match check.on_iterations_exhausted {
                        OnIterationsExhausted::Abort => StepStatus::Failed,
                        OnIterationsExhausted::Continue => StepStatus::Incomplete,
                    };
                    if last_outcome.status == StepStatus::Failed {
                        last_outcome.error_class = Some(ErrorClass::NonRetryable);
                    }
                    break 'iterations;
                }
                last_outcome.status = StepStatus::Incomplete;
                continue 'iterations;
            }
            crate::model::WorkerStatus::Cancelled => {
                last_outcome.status = StepStatus::Cancelled;
                break 'iterations;
            }
            crate::model::WorkerStatus::Failed => {
                let error_class = worker_result.error_class.unwrap_or(ErrorClass::NonRetryable);
                last_outcome.error_class = Some(error_class);

                if error_class == ErrorClass::Fatal {
                    last_outcome.status = StepStatus::Failed;
                    break 'iterations;
                }

                match step.on_failure {
                    OnFailure::Retry if error_class.is_retryable() && attempt < step.max_retries => {
                        attempt += 1;
                        continue 'iterations;
                    }
                    OnFailure::Continue => {
                        last_outcome.status = StepStatus::Failed;
                        break 'iterations;
                    }
                    _ => {
                        last_outcome.status = StepStatus::Failed;
                        break 'iterations;
                    }
                }
            }
        }
    }

    let cascade_abort = last_outcome.status == StepStatus::Failed
        && all_steps
            .get(&step.step_id)
            .map(|s| s.on_failure == OnFailure::Abort)
            .unwrap_or(false);

    {
        let mut guard = outcomes.lock().await;
        guard.insert(step.step_id.clone(), last_outcome);
        if cascade_abort {
            cascade_skip(&step.step_id, &all_steps, &mut guard);
        }
    }
}

/// Runs a `completion_check` command in the step's workspace; true means
/// the step's goal is met (spec §4.11 step 5).
async fn run_completion_check(
    process_manager: &Arc<ProcessManager>,
    check: &CompletionCheckConfig,
    cwd: &Path,
    abort: &CancelToken,
) -> bool {
    let managed = match process_manager
        .spawn(SpawnOptions {
            command: check.command.clone(),
            args: check.args.clone(),
            cwd: Some(cwd.to_path_buf()),
            env: Default::default(),
            abort: Some(abort.clone()),
            timeout_ms: check.timeout_ms,
            process_group: true,
        })
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(command = %check.command, error = %e, "completion check command failed to spawn");
            return false;
        }
    };
    managed.wait_exit_code().await == 0
}

fn cascade_skip(failed_step_id: &str, all_steps: &HashMap<String, StepDef>, outcomes: &mut HashMap<String, StepOutcome>) {
    let mut changed = true;
    while changed {
        changed = false;
        for (id, def) in all_steps.iter() {
            if outcomes.get(id).map(|o| o.status) != Some(StepStatus::Pending) {
                continue;
            }
            let depends_on_failed = def.depends_on.iter().any(|d| {
                d == failed_step_id
                    || outcomes.get(d).map(|o| o.status) == Some(StepStatus::Skipped)
            });
            if depends_on_failed {
                outcomes.get_mut(id).unwrap().status = StepStatus::Skipped;
                changed = true;
            }
        }
    }
}

fn synthesize_job(step: &StepDef) -> Job {
    Job {
        job_id: JobId::new(),
        job_type: JobType::WorkerTask,
        priority: Priority {
            value: 0,
            class: PriorityClass::Batch,
        },
        payload: serde_json::json!({"workerKind": step.worker_kind.as_provider()}),
        limits: JobLimits {
            timeout_ms: step.timeout_ms,
            max_attempts: step.max_retries + 1,
            cost_hint: None,
        },
        context: JobContext {
            trace_id: step.step_id.clone(),
            correlation_id: step.step_id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureController;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::budget::ExecutionBudget;
    use crate::config::{BackpressureConfig, BudgetConfig, CircuitBreakerConfig};
    use crate::worker::{AdapterRegistry, MockAdapter, MockBehavior};
    use crate::workspace_lock::WorkspaceLock;
    use std::time::Duration as StdDuration;

    fn step(id: &str, deps: &[&str]) -> StepDef {
        StepDef {
            step_id: id.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            inputs: Vec::new(),
            worker_kind: crate::model::WorkerKind::Custom,
            instructions: "go".to_string(),
            capabilities: vec![Capability::Edit],
            output_artifacts: Vec::new(),
            on_failure: OnFailure::Abort,
            max_retries: 0,
            completion_check: None,
            probe: None,
            timeout_ms: 5000,
        }
    }

    async fn executor_with(behavior: MockBehavior) -> WorkflowExecutor {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new(behavior)));
        let gateway = Arc::new(WorkerDelegationGateway::new(
            Arc::new(registry),
            Arc::new(WorkspaceLock::new()),
        ));
        let permit_gate = Arc::new(PermitGate::new(
            Arc::new(BackpressureController::new(BackpressureConfig::default())),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(ExecutionBudget::new(&BudgetConfig {
                max_concurrency: 10,
                max_rps: 100,
                max_cost_budget: None,
                max_attempts: 5,
            })),
        ));
        WorkflowExecutor::new(permit_gate, gateway, Arc::new(ProcessManager::new()))
    }

    #[tokio::test]
    async fn two_step_workflow_succeeds() {
        let executor = executor_with(MockBehavior::SucceedAfter(StdDuration::from_millis(5))).await;
        let def = WorkflowDef {
            workflow_id: "wf-succeed".to_string(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            timeout: StdDuration::from_secs(5),
            concurrency: None,
        };
        let tmp = tempfile::tempdir().unwrap();
        let outcome = executor
            .run(def, &tmp.path().join("ws"), &tmp.path().join("ctx"))
            .await
            .unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Succeeded);
        assert_eq!(outcome.steps["a"].status, StepStatus::Succeeded);
        assert_eq!(outcome.steps["b"].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn workflow_timeout_cascades_to_cancelled_and_skipped() {
        let executor = executor_with(MockBehavior::HangUntilCancelled).await;
        let def = WorkflowDef {
            workflow_id: "wf-timeout".to_string(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            timeout: StdDuration::from_millis(100),
            concurrency: None,
        };
        let tmp = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let outcome = executor
            .run(def, &tmp.path().join("ws"), &tmp.path().join("ctx"))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(outcome.status, WorkflowStatus::TimedOut);
        assert_eq!(outcome.steps["a"].status, StepStatus::Cancelled);
        assert_eq!(outcome.steps["b"].status, StepStatus::Skipped);
        assert!(elapsed >= StdDuration::from_millis(80) && elapsed <= StdDuration::from_millis(2500));
    }

    #[tokio::test]
    async fn failed_step_with_abort_skips_dependents() {
        let executor = executor_with(MockBehavior::FailAfter(
            StdDuration::from_millis(5),
            ErrorClass::NonRetryable,
        ))
        .await;
        let def = WorkflowDef {
            workflow_id: "wf-fail".to_string(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            timeout: StdDuration::from_secs(5),
            concurrency: None,
        };
        let tmp = tempfile::tempdir().unwrap();
        let outcome = executor
            .run(def, &tmp.path().join("ws"), &tmp.path().join("ctx"))
            .await
            .unwrap();
        assert_eq!(outcome.steps["a"].status, StepStatus::Failed);
        assert_eq!(outcome.steps["b"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn completion_check_loops_until_it_passes() {
        let executor = executor_with(MockBehavior::SucceedAfter(StdDuration::from_millis(5))).await;
        let tmp = tempfile::tempdir().unwrap();

        let mut a = step("a", &[]);
        a.completion_check = Some(CompletionCheckConfig {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "c=$(cat count 2>/dev/null || echo 0); c=$((c+1)); echo $c > count; [ $c -ge 2 ]".to_string(),
            ],
            timeout_ms: None,
            max_iterations: 5,
            on_iterations_exhausted: OnIterationsExhausted::Abort,
        });
        let def = WorkflowDef {
            workflow_id: "wf-check".to_string(),
            steps: vec![a],
            timeout: StdDuration::from_secs(5),
            concurrency: None,
        };
        let outcome = executor
            .run(def, &tmp.path().join("ws"), &tmp.path().join("ctx"))
            .await
            .unwrap();
        assert_eq!(outcome.steps["a"].status, StepStatus::Succeeded);
        assert_eq!(outcome.steps["a"].iterations, 2);
    }

    #[tokio::test]
    async fn completion_check_exhausts_iterations_and_aborts() {
        let executor = executor_with(MockBehavior::SucceedAfter(StdDuration::from_millis(5))).await;
        let tmp = tempfile::tempdir().unwrap();

        let mut a = step("a", &[]);
        a.completion_check = Some(CompletionCheckConfig {
            command: "false".to_string(),
            args: Vec::new(),
            timeout_ms: None,
            max_iterations: 2,
            on_iterations_exhausted: OnIterationsExhausted::Abort,
        });
        let def = WorkflowDef {
            workflow_id: "wf-check-exhausted".to_string(),
            steps: vec![a],
            timeout: StdDuration::from_secs(5),
            concurrency: None,
        };
        let outcome = executor
            .run(def, &tmp.path().join("ws"), &tmp.path().join("ctx"))
            .await
            .unwrap();
        assert_eq!(outcome.steps["a"].status, StepStatus::Failed);
        assert_eq!(outcome.steps["a"].iterations, 2);
    }
}
