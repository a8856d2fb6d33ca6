//! Black-box end-to-end coverage of the six admission/delegation/workflow
//! scenarios (spec §8), driven entirely through public constructors since
//! `CoreRuntime::new` wires its own fixed adapter set and cannot be handed a
//! mock adapter after construction.

test_r::enable!();

use agentcore::backpressure::BackpressureController;
use agentcore::budget::ExecutionBudget;
use agentcore::cancel::{CancelReason, CancelToken};
use agentcore::circuit_breaker::CircuitBreakerRegistry;
use agentcore::config::{BackpressureConfig, BudgetConfig, CircuitBreakerConfig};
use agentcore::gateway::{DelegateOptions, WorkerDelegationGateway};
use agentcore::ids::{JobId, WorkerTaskId};
use agentcore::model::{
    Capability, ErrorClass, Job, JobContext, JobLimits, JobType, OutputMode, Priority,
    PriorityClass, WorkerBudget, WorkerKind, WorkerStatus, WorkerTask,
};
use agentcore::permit_gate::PermitGate;
use agentcore::process_manager::ProcessManager;
use agentcore::sentinel::{
    ActivityKey, ActivityTracker, ActivitySource, NoOutputWatcher, NoOutputWatcherConfig,
    SentinelAction, SentinelGuard,
};
use agentcore::worker::{AdapterRegistry, MockAdapter, MockBehavior};
use agentcore::workflow::dag::{OnFailure, StepDef, WorkflowDef};
use agentcore::workflow::executor::{WorkflowExecutor, WorkflowStatus};
use agentcore::workflow::step::StepStatus;
use agentcore::workspace_lock::WorkspaceLock;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use test_r::test;

fn budget_config() -> BudgetConfig {
    BudgetConfig {
        max_concurrency: 10,
        max_rps: 100,
        max_cost_budget: None,
        max_attempts: 3,
    }
}

fn job(timeout_ms: u64, max_attempts: u32) -> Job {
    Job {
        job_id: JobId::new(),
        job_type: JobType::WorkerTask,
        priority: Priority { value: 0, class: PriorityClass::Batch },
        payload: serde_json::json!({"workerKind": "CUSTOM"}),
        limits: JobLimits { timeout_ms, max_attempts, cost_hint: None },
        context: JobContext { trace_id: "t".into(), correlation_id: "c".into() },
    }
}

fn task(workspace_ref: &str, abort: CancelToken) -> WorkerTask {
    WorkerTask {
        worker_task_id: WorkerTaskId::new(),
        worker_kind: WorkerKind::Custom,
        workspace_ref: workspace_ref.into(),
        instructions: "do it".to_string(),
        capabilities: vec![Capability::Edit],
        output_mode: OutputMode::Batch,
        budget: WorkerBudget {
            deadline_at_ms: chrono::Utc::now().timestamp_millis() + 5000,
            max_steps: None,
            max_command_time_ms: None,
        },
        env: HashMap::new(),
        abort,
        model: None,
    }
}

/// Builds a full admission/delegation stack around a single mock adapter,
/// mirroring the pattern in `gateway.rs`'s and `workflow/executor.rs`'s own
/// `#[cfg(test)]` modules.
fn stack(behavior: MockBehavior) -> (Arc<PermitGate>, Arc<WorkerDelegationGateway>, Arc<ExecutionBudget>, Arc<WorkspaceLock>) {
    let budget = Arc::new(ExecutionBudget::new(&budget_config()));
    let permit_gate = Arc::new(PermitGate::new(
        Arc::new(BackpressureController::new(BackpressureConfig::default())),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        budget.clone(),
    ));
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(MockAdapter::new(behavior)));
    let workspace_lock = Arc::new(WorkspaceLock::new());
    let gateway = Arc::new(WorkerDelegationGateway::new(Arc::new(registry), workspace_lock.clone()));
    (permit_gate, gateway, budget, workspace_lock)
}

// Scenario 1: permit granted, worker succeeds, slots return to zero.
#[test]
async fn permit_granted_worker_succeeds() {
    let (permit_gate, gateway, budget, _lock) = stack(MockBehavior::SucceedAfter(Duration::from_millis(10)));

    let j = job(5_000, 1);
    let permit = permit_gate.request_permit(&j, 0).expect("should grant");
    assert_eq!(budget.get_active_slots(), 1);

    let result = gateway
        .delegate_task(task("/ws/one", permit.abort.clone()), &permit, DelegateOptions::default())
        .await
        .expect("mock adapter succeeds");
    assert_eq!(result.status, WorkerStatus::Succeeded);

    permit_gate.complete_permit(permit.permit_id);
    assert_eq!(budget.get_active_slots(), 0);
    assert_eq!(permit_gate.active_count(), 0);
}

// Scenario 2: two tasks against the same workspace serialize rather than
// run concurrently.
#[test]
async fn workspace_serialization_prevents_overlap() {
    let (permit_gate, gateway, _budget, lock) = stack(MockBehavior::SucceedAfter(Duration::from_millis(80)));

    let j1 = job(5_000, 1);
    let j2 = job(5_000, 1);
    let permit1 = permit_gate.request_permit(&j1, 0).unwrap();
    let permit2 = permit_gate.request_permit(&j2, 0).unwrap();

    let gateway_a = gateway.clone();
    let gateway_b = gateway.clone();
    let started = std::time::Instant::now();

    let (a, b) = tokio::join!(
        async {
            let out = gateway_a
                .delegate_task(task("/ws/shared", permit1.abort.clone()), &permit1, DelegateOptions::default())
                .await
                .unwrap();
            (out, started.elapsed())
        },
        async {
            let out = gateway_b
                .delegate_task(task("/ws/shared", permit2.abort.clone()), &permit2, DelegateOptions::default())
                .await
                .unwrap();
            (out, started.elapsed())
        }
    );

    permit_gate.complete_permit(permit1.permit_id);
    permit_gate.complete_permit(permit2.permit_id);

    assert_eq!(a.0.status, WorkerStatus::Succeeded);
    assert_eq!(b.0.status, WorkerStatus::Succeeded);
    // Serialized through the workspace lock: the later finisher must take
    // roughly two mock-adapter delays, not one.
    let later = a.1.max(b.1);
    assert!(later >= Duration::from_millis(150), "expected serialized completion, got {later:?}");
    assert!(!lock.is_locked(std::path::Path::new("/ws/shared")));
}

// Scenario 3: repeated failures open the circuit; it stays open until the
// real-time reset timeout elapses, then a successful probe closes it.
#[test]
async fn circuit_opens_then_recovers_after_reset_timeout() {
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_millis(150),
        half_open_max_attempts: 1,
    }));
    let permit_gate = Arc::new(PermitGate::new(
        Arc::new(BackpressureController::new(BackpressureConfig::default())),
        breakers.clone(),
        Arc::new(ExecutionBudget::new(&budget_config())),
    ));

    for _ in 0..3 {
        breakers.record_failure("CUSTOM");
    }
    assert!(breakers.is_provider_open("CUSTOM"));

    let rejection = permit_gate.request_permit(&job(5_000, 1), 0).unwrap_err();
    assert_eq!(rejection.reason, agentcore::model::PermitRejectionReason::CircuitOpen);
    assert_eq!(rejection.detail.as_deref(), Some("CUSTOM"));

    // CircuitBreaker uses a real std::time::Instant clock, not one tokio's
    // virtualized timer can fast-forward; wait past the reset timeout.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!breakers.is_provider_open("CUSTOM"));

    // Probe succeeds, closing the breaker; subsequent permits are granted.
    breakers.record_success("CUSTOM");
    let permit = permit_gate.request_permit(&job(5_000, 1), 0).expect("circuit closed, should grant");
    permit_gate.complete_permit(permit.permit_id);
}

// Scenario 4: a permit whose worker hangs past the deadline is cancelled
// by the auto-revoke timer; the caller then finalizes bookkeeping exactly
// as `handle_submit_job` does, releasing the tokens.
#[test]
async fn deadline_auto_revoke_fires_abort_and_releases_tokens() {
    let (permit_gate, gateway, budget, _lock) = stack(MockBehavior::HangUntilCancelled);

    let permit = permit_gate.request_permit(&job(80, 1), 0).unwrap();
    assert_eq!(budget.get_active_slots(), 1);

    let worker_task = task("/ws/deadline", permit.abort.clone());
    let result = gateway
        .delegate_task(worker_task, &permit, DelegateOptions::default())
        .await
        .expect("hung task is cancelled, not errored");
    assert_eq!(result.status, WorkerStatus::Cancelled);
    assert_eq!(permit.abort.reason().await, Some(CancelReason::DeadlineExpired));

    permit_gate.complete_permit(permit.permit_id);
    assert_eq!(budget.get_active_slots(), 0);
    assert_eq!(permit_gate.active_count(), 0);
}

// Scenario 5: a two-step workflow whose first step never finishes times
// out, cancelling the running step and skipping its dependent.
#[test]
async fn workflow_timeout_cascades_to_cancelled_and_skipped() {
    let (permit_gate, gateway, _budget, _lock) = stack(MockBehavior::HangUntilCancelled);
    let executor = WorkflowExecutor::new(permit_gate, gateway, Arc::new(ProcessManager::new()));

    let def = WorkflowDef {
        workflow_id: "wf-e2e-timeout".to_string(),
        steps: vec![step("a", &[]), step("b", &["a"])],
        timeout: Duration::from_millis(120),
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
    assert!(elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(3000));
}

fn step(id: &str, deps: &[&str]) -> StepDef {
    StepDef {
        step_id: id.to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        inputs: Vec::new(),
        worker_kind: WorkerKind::Custom,
        instructions: "go".to_string(),
        capabilities: vec![Capability::Edit],
        output_artifacts: Vec::new(),
        on_failure: OnFailure::Abort,
        max_retries: 0,
        completion_check: None,
        probe: None,
        timeout_ms: 5_000,
    }
}

// Scenario 6: a step that never produces worker output is interrupted by
// the no-output sentinel, which fires with both stall fingerprints.
#[test]
async fn sentinel_interrupts_on_initial_no_output_stall() {
    let tracker = Arc::new(ActivityTracker::new());
    let key = ActivityKey { step_id: 1, iteration: 0 };
    let abort = CancelToken::new();
    let guard = Arc::new(SentinelGuard::new(key, tracker, abort.clone()));

    let watcher = NoOutputWatcher::new(NoOutputWatcherConfig {
        poll_interval: Duration::from_millis(10),
        no_output_timeout: Duration::from_millis(100),
        activity_source: ActivitySource::AnyEvent,
    });
    guard.start_no_output(watcher, SentinelAction::Interrupt);

    abort.cancelled().await;
    assert_eq!(
        abort.reason().await,
        Some(CancelReason::Sentinel("stall/no-output,stall/no-initial-output".to_string()))
    );
    guard.stop();
}

// A failing step that permits retry propagation: on_failure=Abort still
// skips a dependent rather than letting it run against a missing input.
#[test]
async fn failed_step_skips_dependents_end_to_end() {
    let (permit_gate, gateway, _budget, _lock) =
        stack(MockBehavior::FailAfter(Duration::from_millis(5), ErrorClass::NonRetryable));
    let executor = WorkflowExecutor::new(permit_gate, gateway, Arc::new(ProcessManager::new()));

    let def = WorkflowDef {
        workflow_id: "wf-e2e-fail".to_string(),
        steps: vec![step("a", &[]), step("b", &["a"])],
        timeout: Duration::from_secs(5),
        concurrency: None,
    };
    let tmp = tempfile::tempdir().unwrap();
    let outcome = executor
        .run(def, &tmp.path().join("ws"), &tmp.path().join("ctx"))
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.steps["a"].status, StepStatus::Failed);
    assert_eq!(outcome.steps["b"].status, StepStatus::Skipped);
}
