//! WorkerDelegationGateway (spec §4.8).

use crate::cancel::CancelReason;
use crate::error::WorkerError;
use crate::ids::WorkerHandleId;
use crate::model::{WorkerEvent, WorkerHandle, WorkerResult, WorkerTask};
use crate::worker::AdapterRegistry;
use crate::workspace_lock::WorkspaceLock;
use dashmap::DashMap;
use std::sync::Arc;

pub struct DelegateOptions {
    pub acquire_lock_timeout_ms: u64,
}

impl Default for DelegateOptions {
    fn default() -> Self {
        Self {
            acquire_lock_timeout_ms: 30_000,
        }
    }
}

pub struct WorkerDelegationGateway {
    adapters: Arc<AdapterRegistry>,
    workspace_lock: Arc<WorkspaceLock>,
    active: DashMap<WorkerHandleId, WorkerHandle>,
}

impl WorkerDelegationGateway {
    pub fn new(adapters: Arc<AdapterRegistry>, workspace_lock: Arc<WorkspaceLock>) -> Self {
        Self {
            adapters,
            workspace_lock,
            active: DashMap::new(),
        }
    }

    pub fn get_active_worker_count(&self) -> usize {
        self.active.len()
    }

    pub async fn delegate_task(
        &self,
        task: WorkerTask,
        permit: &crate::model::Permit,
        opts: DelegateOptions,
    ) -> Result<WorkerResult, WorkerError> {
        let adapter = self
            .adapters
            .get(task.worker_kind)
            .ok_or(WorkerError::NoAdapter(task.worker_kind))?;

        let workspace_ref = task.workspace_ref.clone();
        let lock_id = permit.permit_id.to_string();
        let acquired = self
            .workspace_lock
            .wait_for_lock(&workspace_ref, &lock_id, opts.acquire_lock_timeout_ms)
            .await;
        if !acquired {
            return Err(WorkerError::LockTimeout {
                path: workspace_ref.display().to_string(),
                timeout_ms: opts.acquire_lock_timeout_ms,
            });
        }

        let release_lock = || self.workspace_lock.release(&workspace_ref, &lock_id);

        let handle = match adapter.start_task(task).await {
            Ok(h) => h,
            Err(e) => {
                release_lock();
                return Err(e.into());
            }
        };

        self.active.insert(handle.handle_id, handle.clone());

        // Wire permit.abort -> adapter.cancel(handle), once-only.
        let permit_abort = permit.abort.clone();
        let cancel_adapter = adapter.clone();
        let cancel_handle = handle.clone();
        let abort_wire = tokio::spawn(async move {
            cancel_adapter_on(permit_abort, cancel_adapter, cancel_handle).await;
        });

        if permit.abort.is_cancelled() {
            adapter.cancel(&handle).await;
        }

        // Deadline timer (spec §4.8 step 5).
        let deadline_at = permit.deadline_at_ms;
        let deadline_adapter = adapter.clone();
        let deadline_handle = handle.clone();
        let deadline_timer = tokio::spawn(async move {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let delay_ms = (deadline_at - now_ms).max(0) as u64;
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            deadline_adapter.cancel(&deadline_handle).await;
        });

        let result = adapter.await_result(handle.clone()).await;

        abort_wire.abort();
        deadline_timer.abort();
        self.active.remove(&handle.handle_id);
        release_lock();

        Ok(result)
    }

    /// Variant that also consumes `streamEvents` concurrently, forwarding
    /// each event to `on_event`.
    pub async fn delegate_task_with_events<F>(
        &self,
        task: WorkerTask,
        permit: &crate::model::Permit,
        opts: DelegateOptions,
        mut on_event: F,
    ) -> Result<WorkerResult, WorkerError>
    where
        F: FnMut(WorkerEvent) + Send + 'static,
    {
        let adapter = self
            .adapters
            .get(task.worker_kind)
            .ok_or(WorkerError::NoAdapter(task.worker_kind))?;

        let workspace_ref = task.workspace_ref.clone();
        let lock_id = permit.permit_id.to_string();
        let acquired = self
            .workspace_lock
            .wait_for_lock(&workspace_ref, &lock_id, opts.acquire_lock_timeout_ms)
            .await;
        if !acquired {
            return Err(WorkerError::LockTimeout {
                path: workspace_ref.display().to_string(),
                timeout_ms: opts.acquire_lock_timeout_ms,
            });
        }

        let handle = match adapter.start_task(task).await {
            Ok(h) => h,
            Err(e) => {
                self.workspace_lock.release(&workspace_ref, &lock_id);
                return Err(e.into());
            }
        };
        self.active.insert(handle.handle_id, handle.clone());

        // Wire permit.abort -> adapter.cancel(handle), once-only.
        let permit_abort = permit.abort.clone();
        let cancel_adapter = adapter.clone();
        let cancel_handle = handle.clone();
        let abort_wire = tokio::spawn(async move {
            cancel_adapter_on(permit_abort, cancel_adapter, cancel_handle).await;
        });

        if permit.abort.is_cancelled() {
            adapter.cancel(&handle).await;
        }

        // Deadline timer (spec §4.8 step 5).
        let deadline_at = permit.deadline_at_ms;
        let deadline_adapter = adapter.clone();
        let deadline_handle = handle.clone();
        let deadline_timer = tokio::spawn(async move {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let delay_ms = (deadline_at - now_ms).max(0) as u64;
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            deadline_adapter.cancel(&deadline_handle).await;
        });

        use futures::StreamExt;
        let mut events = adapter.stream_events(&handle);
        let event_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                on_event(event);
            }
        });

        let result = adapter.await_result(handle.clone()).await;

        // Guard against adapters whose iterable never ends: wait at most 1s.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), event_task).await;

        abort_wire.abort();
        deadline_timer.abort();
        self.active.remove(&handle.handle_id);
        self.workspace_lock.release(&workspace_ref, &lock_id);

        Ok(result)
    }

    pub async fn cancel_all(&self) {
        let handles: Vec<(WorkerHandleId, WorkerHandle)> = self
            .active
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let futures = handles.into_iter().map(|(_, handle)| {
            let adapters = self.adapters.clone();
            async move {
                if let Some(adapter) = adapters.get(handle.worker_kind) {
                    adapter.cancel(&handle).await;
                }
            }
        });
        futures::future::join_all(futures).await;
    }
}

async fn cancel_adapter_on(
    permit_abort: crate::cancel::CancelToken,
    adapter: Arc<dyn crate::worker::WorkerAdapter>,
    handle: WorkerHandle,
) {
    permit_abort.cancelled().await;
    let _ = CancelReason::UserCancel;
    adapter.cancel(&handle).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::ids::PermitId;
    use crate::model::{Capability, OutputMode, Permit, TokensGranted, WorkerBudget, WorkerKind};
    use crate::worker::{MockAdapter, MockBehavior};
    use std::collections::HashMap;

    fn test_permit() -> Permit {
        Permit {
            permit_id: PermitId::new(),
            job_id: crate::ids::JobId::new(),
            deadline_at_ms: chrono::Utc::now().timestamp_millis() + 5000,
            attempt_index: 0,
            tokens_granted: TokensGranted::default(),
            circuit_state_snapshot: HashMap::new(),
            abort: CancelToken::new(),
            workspace_lock_token: None,
        }
    }

    fn test_task() -> WorkerTask {
        WorkerTask {
            worker_task_id: crate::ids::WorkerTaskId::new(),
            worker_kind: WorkerKind::Custom,
            workspace_ref: "/ws/shared".into(),
            instructions: "do it".to_string(),
            capabilities: vec![Capability::Edit],
            output_mode: OutputMode::Batch,
            budget: WorkerBudget {
                deadline_at_ms: chrono::Utc::now().timestamp_millis() + 5000,
                max_steps: None,
                max_command_time_ms: None,
            },
            env: HashMap::new(),
            abort: CancelToken::new(),
            model: None,
        }
    }

    #[tokio::test]
    async fn delegate_task_returns_succeeded_and_releases_lock() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new(MockBehavior::SucceedAfter(
            std::time::Duration::from_millis(10),
        ))));
        let gateway = WorkerDelegationGateway::new(
            Arc::new(registry),
            Arc::new(WorkspaceLock::new()),
        );

        let permit = test_permit();
        let result = gateway
            .delegate_task(test_task(), &permit, DelegateOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, crate::model::WorkerStatus::Succeeded);
        assert!(!gateway.workspace_lock.is_locked(std::path::Path::new("/ws/shared")));
        assert_eq!(gateway.get_active_worker_count(), 0);
    }

    #[tokio::test]
    async fn delegate_task_with_events_forwards_events_and_releases_lock() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new(MockBehavior::SucceedAfter(
            std::time::Duration::from_millis(10),
        ))));
        let gateway = WorkerDelegationGateway::new(
            Arc::new(registry),
            Arc::new(WorkspaceLock::new()),
        );

        let permit = test_permit();
        let mut task = test_task();
        task.output_mode = OutputMode::Stream;
        let result = gateway
            .delegate_task_with_events(task, &permit, DelegateOptions::default(), |_event| {})
            .await
            .unwrap();

        assert_eq!(result.status, crate::model::WorkerStatus::Succeeded);
        assert!(!gateway.workspace_lock.is_locked(std::path::Path::new("/ws/shared")));
        assert_eq!(gateway.get_active_worker_count(), 0);
    }

    #[tokio::test]
    async fn delegate_task_with_events_cancels_on_permit_abort() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new(MockBehavior::HangUntilCancelled)));
        let gateway = WorkerDelegationGateway::new(
            Arc::new(registry),
            Arc::new(WorkspaceLock::new()),
        );

        let permit = test_permit();
        let mut task = test_task();
        task.output_mode = OutputMode::Stream;
        task.abort = permit.abort.clone();
        let abort = permit.abort.clone();
        let handle = tokio::spawn(async move {
            gateway
                .delegate_task_with_events(task, &permit, DelegateOptions::default(), |_event| {})
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        abort.cancel(CancelReason::UserCancel).await;
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should resolve once cancelled")
            .unwrap()
            .unwrap();
        assert_eq!(result.status, crate::model::WorkerStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_adapter_fails_fast() {
        let gateway = WorkerDelegationGateway::new(
            Arc::new(AdapterRegistry::new()),
            Arc::new(WorkspaceLock::new()),
        );
        let permit = test_permit();
        let err = gateway
            .delegate_task(test_task(), &permit, DelegateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NoAdapter(_)));
    }
}
