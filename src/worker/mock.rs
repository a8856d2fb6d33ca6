//! Mock adapter (spec §9: "the mock adapter exists to drive tests —
//! include it as a variant").

use super::WorkerAdapter;
use crate::ids::WorkerHandleId;
use crate::model::{ErrorClass, WorkerEvent, WorkerHandle, WorkerKind, WorkerResult, WorkerTask};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone)]
pub enum MockBehavior {
    SucceedAfter(Duration),
    FailAfter(Duration, ErrorClass),
    HangUntilCancelled,
}

struct MockTaskState {
    behavior: MockBehavior,
    started_at: std::time::Instant,
}

/// Drives tests against the gateway/executor without spawning real
/// processes. Configured with a single behavior applied to every task it
/// is given, or per-handle via `with_behavior_for`.
pub struct MockAdapter {
    default_behavior: MockBehavior,
    tasks: dashmap::DashMap<WorkerHandleId, Arc<Mutex<MockTaskState>>>,
}

impl MockAdapter {
    pub fn new(default_behavior: MockBehavior) -> Self {
        Self {
            default_behavior,
            tasks: dashmap::DashMap::new(),
        }
    }
}

#[async_trait]
impl WorkerAdapter for MockAdapter {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Custom
    }

    async fn start_task(&self, task: WorkerTask) -> Result<WorkerHandle, crate::error::WorkerError> {
        let handle_id = WorkerHandleId::new();
        self.tasks.insert(
            handle_id,
            Arc::new(Mutex::new(MockTaskState {
                behavior: self.default_behavior.clone(),
                started_at: std::time::Instant::now(),
            })),
        );
        Ok(WorkerHandle {
            handle_id,
            worker_kind: task.worker_kind,
            abort: task.abort,
        })
    }

    fn stream_events(&self, _handle: &WorkerHandle) -> BoxStream<'static, WorkerEvent> {
        Box::pin(futures::stream::empty())
    }

    async fn cancel(&self, handle: &WorkerHandle) {
        if let Some(state) = self.tasks.get(&handle.handle_id) {
            let mut guard = state.lock().await;
            guard.behavior = MockBehavior::FailAfter(Duration::ZERO, ErrorClass::RetryableTransient);
        }
    }

    async fn await_result(&self, handle: WorkerHandle) -> WorkerResult {
        let Some(state) = self.tasks.get(&handle.handle_id).map(|e| e.clone()) else {
            return WorkerResult::failed(Duration::ZERO, ErrorClass::NonRetryable);
        };
        let behavior = state.lock().await.behavior.clone();

        let result = match behavior {
            MockBehavior::SucceedAfter(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => WorkerResult::succeeded(delay),
                    _ = handle.abort.cancelled() => WorkerResult::cancelled(delay),
                }
            }
            MockBehavior::FailAfter(delay, class) => {
                tokio::time::sleep(delay).await;
                WorkerResult::failed(delay, class)
            }
            MockBehavior::HangUntilCancelled => {
                handle.abort.cancelled().await;
                let elapsed = state.lock().await.started_at.elapsed();
                WorkerResult::cancelled(elapsed)
            }
        };

        self.tasks.remove(&handle.handle_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::model::{Capability, OutputMode, WorkerBudget};
    use std::collections::HashMap;

    fn task(abort: CancelToken) -> WorkerTask {
        WorkerTask {
            worker_task_id: crate::ids::WorkerTaskId::new(),
            worker_kind: WorkerKind::Custom,
            workspace_ref: "/tmp/ws".into(),
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

    #[tokio::test]
    async fn succeeds_after_configured_delay() {
        let adapter = MockAdapter::new(MockBehavior::SucceedAfter(Duration::from_millis(10)));
        let handle = adapter.start_task(task(CancelToken::new())).await.unwrap();
        let result = adapter.await_result(handle).await;
        assert_eq!(result.status, crate::model::WorkerStatus::Succeeded);
    }

    #[tokio::test]
    async fn hang_until_cancelled_resolves_on_abort() {
        let adapter = Arc::new(MockAdapter::new(MockBehavior::HangUntilCancelled));
        let abort = CancelToken::new();
        let handle = adapter.start_task(task(abort.clone())).await.unwrap();
        let awaiting = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.await_result(handle).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.cancel(crate::cancel::CancelReason::UserCancel).await;
        let result = awaiting.await.unwrap();
        assert_eq!(result.status, crate::model::WorkerStatus::Cancelled);
    }
}
