//! PermitGate (spec §4.4): composite admission decision.

use crate::backpressure::{BackpressureController, BackpressureResponse};
use crate::budget::{AcquireFailure, ExecutionBudget, Tokens};
use crate::cancel::{CancelReason, CancelToken};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::ids::PermitId;
use crate::model::{CircuitState, Job, Permit, PermitRejection, PermitRejectionReason, TokensGranted};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

struct ActiveEntry {
    tokens: Tokens,
    deadline_timer: JoinHandle<()>,
}

pub struct PermitGate {
    backpressure: Arc<BackpressureController>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    budget: Arc<ExecutionBudget>,
    active: DashMap<PermitId, ActiveEntry>,
}

impl PermitGate {
    pub fn new(
        backpressure: Arc<BackpressureController>,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
        budget: Arc<ExecutionBudget>,
    ) -> Self {
        Self {
            backpressure,
            circuit_breakers,
            budget,
            active: DashMap::new(),
        }
    }

    /// Performs the six-step admission sequence of spec §4.4.
    pub fn request_permit(&self, job: &Job, attempt_index: u32) -> Result<Permit, PermitRejection> {
        // 1. Backpressure.
        if self.backpressure.check() == BackpressureResponse::Reject {
            return Err(PermitRejection::new(
                PermitRejectionReason::GlobalShed,
                self.backpressure.load_summary(),
            ));
        }

        // 2. Circuit breaker (provider-specific only, per DESIGN.md Open
        // Question #1 decision).
        let provider = job.infer_provider();
        if self.circuit_breakers.is_provider_open(&provider) {
            return Err(PermitRejection::new(
                PermitRejectionReason::CircuitOpen,
                provider.clone(),
            ));
        }

        // 3. Attempt budget.
        if !self
            .budget
            .check_attempts(attempt_index, job.limits.max_attempts)
        {
            return Err(PermitRejection::new(
                PermitRejectionReason::BudgetExhausted,
                format!("attempts ({attempt_index}) exceeded max ({})", job.limits.max_attempts),
            ));
        }

        // 4. Token consumption, mapped to the appropriate rejection reason.
        let tokens = self.budget.consume(job.limits.cost_hint).map_err(|failure| match failure {
            AcquireFailure::Concurrency => {
                PermitRejection::new(PermitRejectionReason::ConcurrencyLimit, "concurrency limit reached")
            }
            AcquireFailure::Rate => PermitRejection::new(PermitRejectionReason::RateLimit, "rate limit reached"),
            AcquireFailure::Cost => PermitRejection::new(PermitRejectionReason::BudgetExhausted, "cost budget exhausted"),
        })?;

        // 5. Allocate.
        let permit_id = PermitId::new();
        let abort = CancelToken::new();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let deadline_at_ms = now_ms + job.limits.timeout_ms as i64;
        let circuit_state_snapshot: std::collections::HashMap<String, CircuitState> =
            self.circuit_breakers.get_snapshot();

        let permit = Permit {
            permit_id,
            job_id: job.job_id,
            deadline_at_ms,
            attempt_index,
            tokens_granted: TokensGranted {
                concurrency: true,
                rps: true,
                cost: job.limits.cost_hint,
            },
            circuit_state_snapshot,
            abort: abort.clone(),
            workspace_lock_token: None,
        };

        // 6. Arm the deadline auto-revoke timer.
        let delay_ms = (deadline_at_ms - now_ms).max(0) as u64;
        let timer_abort = abort.clone();
        let deadline_timer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            timer_abort.cancel(CancelReason::DeadlineExpired).await;
        });

        self.active.insert(
            permit_id,
            ActiveEntry {
                tokens,
                deadline_timer,
            },
        );

        Ok(permit)
    }

    /// Releases tokens, cancels the deadline timer, drops the entry. Never
    /// aborts. Idempotent: a second call is a no-op.
    pub fn complete_permit(&self, permit_id: PermitId) {
        if let Some((_, entry)) = self.active.remove(&permit_id) {
            entry.deadline_timer.abort();
            self.budget.release(entry.tokens);
            debug!(%permit_id, "permit completed");
        }
    }

    /// Same as `complete_permit`, additionally fires the abort handle.
    /// A no-op if the permit was already completed/revoked.
    pub fn revoke_permit(&self, permit_id: PermitId, abort: &CancelToken, reason: CancelReason) {
        if let Some((_, entry)) = self.active.remove(&permit_id) {
            entry.deadline_timer.abort();
            self.budget.release(entry.tokens);
            let abort = abort.clone();
            tokio::spawn(async move { abort.cancel(reason).await });
            debug!(%permit_id, "permit revoked");
        }
    }

    /// Aborts and releases all active permits.
    pub fn dispose(&self) {
        let ids: Vec<PermitId> = self.active.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.active.remove(&id) {
                entry.deadline_timer.abort();
                self.budget.release(entry.tokens);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressureConfig, BudgetConfig, CircuitBreakerConfig};
    use crate::model::{Job, JobContext, JobLimits, JobType, Priority, PriorityClass};

    fn gate() -> PermitGate {
        PermitGate::new(
            Arc::new(BackpressureController::new(BackpressureConfig::default())),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(ExecutionBudget::new(&BudgetConfig {
                max_concurrency: 10,
                max_rps: 100,
                max_cost_budget: None,
                max_attempts: 3,
            })),
        )
    }

    fn job() -> Job {
        Job {
            job_id: crate::ids::JobId::new(),
            job_type: JobType::WorkerTask,
            priority: Priority { value: 0, class: PriorityClass::Batch },
            payload: serde_json::json!({"workerKind": "CLAUDE_CODE"}),
            limits: JobLimits { timeout_ms: 5000, max_attempts: 1, cost_hint: None },
            context: JobContext { trace_id: "t".into(), correlation_id: "c".into() },
        }
    }

    #[tokio::test]
    async fn grants_and_completes_with_zero_active_slots_at_quiescence() {
        let gate = gate();
        let permit = gate.request_permit(&job(), 0).expect("should grant");
        assert_eq!(gate.active_count(), 1);
        gate.complete_permit(permit.permit_id);
        assert_eq!(gate.active_count(), 0);
        assert_eq!(gate.budget.get_active_slots(), 0);
    }

    #[tokio::test]
    async fn attempt_index_at_max_is_rejected() {
        let gate = gate();
        let mut j = job();
        j.limits.max_attempts = 1;
        let rejection = gate.request_permit(&j, 1).unwrap_err();
        assert_eq!(rejection.reason, PermitRejectionReason::BudgetExhausted);
    }

    #[tokio::test]
    async fn complete_permit_is_idempotent() {
        let gate = gate();
        let permit = gate.request_permit(&job(), 0).unwrap();
        gate.complete_permit(permit.permit_id);
        gate.complete_permit(permit.permit_id);
        assert_eq!(gate.active_count(), 0);
    }

    #[tokio::test]
    async fn revoke_after_complete_is_noop() {
        let gate = gate();
        let permit = gate.request_permit(&job(), 0).unwrap();
        gate.complete_permit(permit.permit_id);
        gate.revoke_permit(permit.permit_id, &permit.abort, CancelReason::UserCancel);
        assert!(!permit.abort.is_cancelled());
    }

    #[tokio::test]
    async fn circuit_open_rejects_with_provider_detail() {
        let gate = gate();
        for _ in 0..3 {
            gate.circuit_breakers.record_failure("CLAUDE_CODE");
        }
        let rejection = gate.request_permit(&job(), 0).unwrap_err();
        assert_eq!(rejection.reason, PermitRejectionReason::CircuitOpen);
        assert_eq!(rejection.detail.as_deref(), Some("CLAUDE_CODE"));
    }
}
