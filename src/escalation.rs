//! EscalationManager (spec §4.10): fleet-wide escalation events.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CRASH_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationScope {
    WorkerKind,
    Workspace,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationAction {
    Isolate,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub scope: EscalationScope,
    pub action: EscalationAction,
    pub target: String,
    pub reason: String,
    pub timestamp_ms: i64,
    pub severity: Severity,
}

pub struct EscalationConfig {
    pub crash_threshold: u32,
    pub latest_wins_threshold: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            crash_threshold: 3,
            latest_wins_threshold: 3,
        }
    }
}

struct State {
    crash_timestamps: HashMap<String, Vec<Instant>>,
    cancel_timeouts: HashSet<String>,
    latest_wins: HashMap<String, u32>,
    history: Vec<EscalationEvent>,
}

pub type EscalationListener = Box<dyn Fn(&EscalationEvent) + Send + Sync>;

pub struct EscalationManager {
    config: EscalationConfig,
    state: Mutex<State>,
    listeners: Mutex<Vec<EscalationListener>>,
}

impl EscalationManager {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                crash_timestamps: HashMap::new(),
                cancel_timeouts: HashSet::new(),
                latest_wins: HashMap::new(),
                history: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn record_worker_crash(&self, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .crash_timestamps
            .entry(kind.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// A cancel that never produced an exit ("ghost" process).
    pub fn record_cancel_timeout(&self, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .cancel_timeouts
            .insert(kind.to_string());
    }

    pub fn record_latest_wins(&self, workspace_path: &str) {
        *self
            .state
            .lock()
            .unwrap()
            .latest_wins
            .entry(workspace_path.to_string())
            .or_insert(0) += 1;
    }

    pub fn on_escalation(&self, listener: EscalationListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn get_history(&self) -> Vec<EscalationEvent> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.crash_timestamps.clear();
        state.cancel_timeouts.clear();
        state.latest_wins.clear();
        state.history.clear();
    }

    /// Trims out-of-window crash timestamps and clears the transient
    /// cancel-timeout set as a side effect of evaluation (spec §4.10).
    pub fn evaluate(&self) -> Vec<EscalationEvent> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut state = self.state.lock().unwrap();
        let mut events = Vec::new();
        let mut kinds_with_issues: HashSet<String> = HashSet::new();

        let cutoff = Instant::now().checked_sub(CRASH_WINDOW);
        for (kind, timestamps) in state.crash_timestamps.iter_mut() {
            if let Some(cutoff) = cutoff {
                timestamps.retain(|t| *t >= cutoff);
            }
            if timestamps.len() as u32 >= self.config.crash_threshold {
                events.push(EscalationEvent {
                    scope: EscalationScope::WorkerKind,
                    action: EscalationAction::Isolate,
                    target: kind.clone(),
                    reason: format!(
                        "crash rate {} exceeded threshold {} within 60s window",
                        timestamps.len(),
                        self.config.crash_threshold
                    ),
                    timestamp_ms: now_ms,
                    severity: Severity::Error,
                });
                kinds_with_issues.insert(kind.clone());
            }
        }

        for kind in state.cancel_timeouts.drain() {
            events.push(EscalationEvent {
                scope: EscalationScope::WorkerKind,
                action: EscalationAction::Isolate,
                target: kind.clone(),
                reason: "ghost: cancel never produced an exit".to_string(),
                timestamp_ms: now_ms,
                severity: Severity::Warning,
            });
            kinds_with_issues.insert(kind);
        }

        for (workspace, count) in state.latest_wins.iter() {
            if *count >= self.config.latest_wins_threshold {
                events.push(EscalationEvent {
                    scope: EscalationScope::Workspace,
                    action: EscalationAction::Stop,
                    target: workspace.clone(),
                    reason: format!(
                        "latest-wins count {} reached threshold {}",
                        count, self.config.latest_wins_threshold
                    ),
                    timestamp_ms: now_ms,
                    severity: Severity::Error,
                });
            }
        }

        if kinds_with_issues.len() >= 2 {
            events.push(EscalationEvent {
                scope: EscalationScope::Global,
                action: EscalationAction::Stop,
                target: "*".to_string(),
                reason: format!(
                    "issues span {} worker kinds in one evaluation",
                    kinds_with_issues.len()
                ),
                timestamp_ms: now_ms,
                severity: Severity::Fatal,
            });
        }

        state.history.extend(events.iter().cloned());
        drop(state);

        let listeners = self.listeners.lock().unwrap();
        for event in &events {
            for listener in listeners.iter() {
                listener(event);
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_rate_per_kind_triggers_isolate() {
        let mgr = EscalationManager::new(EscalationConfig::default());
        for _ in 0..3 {
            mgr.record_worker_crash("CLAUDE_CODE");
        }
        let events = mgr.evaluate();
        assert!(events.iter().any(|e| {
            e.scope == EscalationScope::WorkerKind
                && e.action == EscalationAction::Isolate
                && e.target == "CLAUDE_CODE"
        }));
    }

    #[test]
    fn cancel_timeout_emits_ghost_warning_and_clears() {
        let mgr = EscalationManager::new(EscalationConfig::default());
        mgr.record_cancel_timeout("CODEX_CLI");
        let events = mgr.evaluate();
        assert!(events
            .iter()
            .any(|e| e.severity == Severity::Warning && e.target == "CODEX_CLI"));
        // Transient set cleared: a second evaluate sees nothing new.
        let events2 = mgr.evaluate();
        assert!(!events2.iter().any(|e| e.target == "CODEX_CLI"));
    }

    #[test]
    fn latest_wins_threshold_stops_workspace() {
        let mgr = EscalationManager::new(EscalationConfig::default());
        for _ in 0..3 {
            mgr.record_latest_wins("/ws/shared");
        }
        let events = mgr.evaluate();
        assert!(events
            .iter()
            .any(|e| e.scope == EscalationScope::Workspace && e.action == EscalationAction::Stop));
    }

    #[test]
    fn two_kinds_with_issues_emit_global_stop() {
        let mgr = EscalationManager::new(EscalationConfig::default());
        for _ in 0..3 {
            mgr.record_worker_crash("CLAUDE_CODE");
        }
        mgr.record_cancel_timeout("CODEX_CLI");
        let events = mgr.evaluate();
        assert!(events
            .iter()
            .any(|e| e.scope == EscalationScope::Global && e.severity == Severity::Fatal));
    }

    #[test]
    fn reset_clears_all_state() {
        let mgr = EscalationManager::new(EscalationConfig::default());
        mgr.record_worker_crash("X");
        mgr.evaluate();
        mgr.reset();
        assert!(mgr.get_history().is_empty());
    }
}
