//! ExecutionBudget (spec §4.1): concurrency, rate, cost, and attempt pools.

use crate::config::BudgetConfig;
use crate::ids::JobId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    Concurrency,
    Rate,
    Cost,
}

/// Tokens acquired by a single `consume()` call; must be passed back to
/// `release()` exactly once.
#[derive(Debug)]
pub struct Tokens {
    concurrency_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    rate_acquired: bool,
    cost_reserved: Option<f64>,
}

pub struct ExecutionBudget {
    concurrency: std::sync::Arc<Semaphore>,
    max_concurrency: usize,
    max_rps: u32,
    rate_window: Mutex<VecDeque<std::time::Instant>>,
    max_cost_budget: Option<f64>,
    cost_spent: Mutex<f64>,
    max_attempts: u32,
    attempts: DashMap<JobId, AtomicU32>,
    active_slots: AtomicUsize,
}

impl ExecutionBudget {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            concurrency: std::sync::Arc::new(Semaphore::new(config.max_concurrency)),
            max_concurrency: config.max_concurrency,
            max_rps: config.max_rps,
            rate_window: Mutex::new(VecDeque::new()),
            max_cost_budget: config.max_cost_budget,
            cost_spent: Mutex::new(0.0),
            max_attempts: config.max_attempts,
            attempts: DashMap::new(),
            active_slots: AtomicUsize::new(0),
        }
    }

    /// Non-blocking check that attempt count is within the job's limits
    /// (spec §4.1: `checkAttempts(job, idx)` passes iff `idx < job.limits.maxAttempts`).
    pub fn check_attempts(&self, attempt_index: u32, job_max_attempts: u32) -> bool {
        attempt_index < job_max_attempts
    }

    fn try_acquire_rate(&self) -> bool {
        let now = std::time::Instant::now();
        let mut window = self.rate_window.lock().unwrap();
        let one_second_ago = now.checked_sub(std::time::Duration::from_secs(1));
        if let Some(cutoff) = one_second_ago {
            while let Some(front) = window.front() {
                if *front < cutoff {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
        if (window.len() as u32) < self.max_rps {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    fn try_acquire_cost(&self, cost: f64) -> bool {
        match self.max_cost_budget {
            None => true,
            Some(max) => {
                let mut spent = self.cost_spent.lock().unwrap();
                if *spent + cost <= max {
                    *spent += cost;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn release_cost(&self, cost: f64) {
        let mut spent = self.cost_spent.lock().unwrap();
        *spent = (*spent - cost).max(0.0);
    }

    /// Atomically acquires all required tokens, or undoes partial
    /// acquisitions and returns which check failed first.
    pub fn consume(&self, cost_hint: Option<f64>) -> Result<Tokens, AcquireFailure> {
        let concurrency_permit = match self.concurrency.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(AcquireFailure::Concurrency),
        };

        if !self.try_acquire_rate() {
            drop(concurrency_permit);
            return Err(AcquireFailure::Rate);
        }

        let cost_reserved = match cost_hint {
            Some(c) if c > 0.0 => {
                if !self.try_acquire_cost(c) {
                    drop(concurrency_permit);
                    return Err(AcquireFailure::Cost);
                }
                Some(c)
            }
            _ => None,
        };

        self.active_slots.fetch_add(1, Ordering::SeqCst);
        Ok(Tokens {
            concurrency_permit: Some(concurrency_permit),
            rate_acquired: true,
            cost_reserved,
        })
    }

    /// Reverses a `consume()`. Safe to call even on a `Tokens` whose cost
    /// was never reserved.
    pub fn release(&self, mut tokens: Tokens) {
        if let Some(permit) = tokens.concurrency_permit.take() {
            drop(permit);
            self.active_slots.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(cost) = tokens.cost_reserved.take() {
            self.release_cost(cost);
        }
        tokens.rate_acquired = false;
    }

    /// Used by spec §8's quiescence invariant: `getActiveSlots()==0`.
    pub fn get_active_slots(&self) -> usize {
        self.active_slots.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn record_attempt(&self, job_id: JobId) -> u32 {
        let counter = self
            .attempts
            .entry(job_id)
            .or_insert_with(|| AtomicU32::new(0));
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}
