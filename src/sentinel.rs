//! Sentinel (spec §4.11, stall-detection half): activity tracking and
//! probe-based watchers that abort stuck workflow steps.

use crate::cancel::{CancelReason, CancelToken};
use crate::process_manager::{ProcessManager, SpawnOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityKey {
    pub step_id: u64,
    pub iteration: u32,
}

/// Per (stepId, phase, iteration) record, updated monotonically and read
/// by stall watchers (spec §3 "Sentinel activity record").
#[derive(Debug, Clone, Copy)]
struct ActivityRecord {
    last_worker_output_ts: Option<Instant>,
    last_step_phase_ts: Instant,
    last_step_state_ts: Instant,
    has_received_worker_event: bool,
}

impl ActivityRecord {
    fn new(now: Instant) -> Self {
        Self {
            last_worker_output_ts: None,
            last_step_phase_ts: now,
            last_step_state_ts: now,
            has_received_worker_event: false,
        }
    }
}

#[derive(Default)]
pub struct ActivityTracker {
    records: DashMap<ActivityKey, Mutex<ActivityRecord>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: ActivityKey) -> dashmap::mapref::one::RefMut<'_, ActivityKey, Mutex<ActivityRecord>> {
        self.records
            .entry(key)
            .or_insert_with(|| Mutex::new(ActivityRecord::new(Instant::now())))
    }

    pub fn record_worker_event(&self, key: ActivityKey) {
        let entry = self.entry(key);
        let mut rec = entry.lock().unwrap();
        rec.last_worker_output_ts = Some(Instant::now());
        rec.has_received_worker_event = true;
    }

    pub fn record_phase_change(&self, key: ActivityKey) {
        let entry = self.entry(key);
        entry.lock().unwrap().last_step_phase_ts = Instant::now();
    }

    pub fn record_state_change(&self, key: ActivityKey) {
        let entry = self.entry(key);
        entry.lock().unwrap().last_step_state_ts = Instant::now();
    }

    pub fn has_received_worker_event(&self, key: ActivityKey) -> bool {
        self.entry(key).lock().unwrap().has_received_worker_event
    }

    /// Latest timestamp relevant to `activity_source` (spec §4.11).
    fn last_relevant(&self, key: ActivityKey, source: ActivitySource) -> Option<Instant> {
        let rec = self.entry(key).lock().unwrap();
        match source {
            ActivitySource::WorkerEvent => rec.last_worker_output_ts,
            ActivitySource::AnyEvent => {
                [rec.last_worker_output_ts, Some(rec.last_step_phase_ts), Some(rec.last_step_state_ts)]
                    .into_iter()
                    .flatten()
                    .max()
            }
            ActivitySource::ProbeOnly => None,
        }
    }

    pub fn remove(&self, key: ActivityKey) {
        self.records.remove(&key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySource {
    WorkerEvent,
    AnyEvent,
    /// Watcher disabled.
    ProbeOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentinelAction {
    Interrupt,
    Fail,
    Ignore,
}

impl Default for SentinelAction {
    fn default() -> Self {
        SentinelAction::Interrupt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallKind {
    NoOutput,
    Progress,
    ProbeTerminal,
}

#[derive(Debug, Clone)]
pub struct SentinelTrigger {
    pub kind: StallKind,
    pub fingerprints: Vec<String>,
    pub reason: String,
}

pub struct NoOutputWatcherConfig {
    pub poll_interval: Duration,
    pub no_output_timeout: Duration,
    pub activity_source: ActivitySource,
}

/// Polls periodically; fires when `now - max(relevant activity timestamps)
/// > no_output_timeout` (spec §4.11).
pub struct NoOutputWatcher {
    config: NoOutputWatcherConfig,
}

impl NoOutputWatcher {
    pub fn new(config: NoOutputWatcherConfig) -> Self {
        Self { config }
    }

    /// One polling pass; returns a trigger if the step has been silent too
    /// long, relative to the tracker's start-of-guard baseline `started_at`.
    fn poll(&self, tracker: &ActivityTracker, key: ActivityKey, started_at: Instant) -> Option<SentinelTrigger> {
        if self.config.activity_source == ActivitySource::ProbeOnly {
            return None;
        }
        let last = tracker
            .last_relevant(key, self.config.activity_source)
            .unwrap_or(started_at);
        if last.elapsed() <= self.config.no_output_timeout {
            return None;
        }
        let mut fingerprints = vec!["stall/no-output".to_string()];
        if !tracker.has_received_worker_event(key) {
            fingerprints.push("stall/no-initial-output".to_string());
        }
        Some(SentinelTrigger {
            kind: StallKind::NoOutput,
            fingerprints,
            reason: format!(
                "no activity for {:?} (timeout {:?})",
                last.elapsed(),
                self.config.no_output_timeout
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeClass {
    Progressing,
    Stalled,
    Terminal,
}

#[derive(Debug, Clone)]
pub struct ProbeOutput {
    pub class: ProbeClass,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnProbeError {
    Ignore,
    Stall,
    Terminal,
}

impl Default for OnProbeError {
    fn default() -> Self {
        OnProbeError::Ignore
    }
}

#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Runs the probe command once and parses its JSON stdout. An `Err`
    /// models either a non-JSON line or (when `require_zero_exit`) a
    /// non-zero exit.
    async fn run(&self) -> Result<ProbeOutput, anyhow::Error>;
}

/// Invokes a probe command once per interval, reading its first stdout
/// line as `{class, digest?}` JSON (spec §4.11 NoProgressWatcher). A
/// non-zero exit or non-JSON line surfaces as an `Err` for
/// `on_probe_error` to classify.
pub struct CommandProbeRunner {
    process_manager: std::sync::Arc<ProcessManager>,
    command: String,
    args: Vec<String>,
    cwd: PathBuf,
    timeout_ms: u64,
}

impl CommandProbeRunner {
    pub fn new(
        process_manager: std::sync::Arc<ProcessManager>,
        command: String,
        args: Vec<String>,
        cwd: PathBuf,
        timeout_ms: u64,
    ) -> Self {
        Self { process_manager, command, args, cwd, timeout_ms }
    }
}

#[async_trait]
impl ProbeRunner for CommandProbeRunner {
    async fn run(&self) -> Result<ProbeOutput, anyhow::Error> {
        let managed = self
            .process_manager
            .spawn(SpawnOptions {
                command: self.command.clone(),
                args: self.args.clone(),
                cwd: Some(self.cwd.clone()),
                env: Default::default(),
                abort: None,
                timeout_ms: Some(self.timeout_ms),
                process_group: true,
            })
            .await?;

        let stdout = managed.stdout.lock().await.take();
        let mut first_line = String::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                first_line = line;
            }
        }
        let exit_code = managed.wait_exit_code().await;
        if exit_code != 0 {
            return Err(anyhow::anyhow!("probe command exited with status {exit_code}"));
        }

        let value: serde_json::Value = serde_json::from_str(&first_line)
            .map_err(|e| anyhow::anyhow!("probe stdout not JSON: {e}"))?;
        let class = match value.get("class").and_then(|v| v.as_str()) {
            Some("progressing") => ProbeClass::Progressing,
            Some("stalled") => ProbeClass::Stalled,
            Some("terminal") => ProbeClass::Terminal,
            other => return Err(anyhow::anyhow!("unrecognized probe class: {other:?}")),
        };
        let digest = value
            .get("digest")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| Some(first_line.clone()));
        Ok(ProbeOutput { class, digest })
    }
}

pub struct NoProgressWatcherConfig {
    pub interval: Duration,
    pub stall_threshold: u32,
    pub probe_error_threshold: u32,
    pub on_probe_error: OnProbeError,
    pub on_terminal_action: SentinelAction,
}

pub struct NoProgressWatcher {
    config: NoProgressWatcherConfig,
    probe: std::sync::Arc<dyn ProbeRunner>,
    consecutive_stalls: AtomicU32,
    consecutive_errors: AtomicU32,
    last_digest: Mutex<Option<String>>,
}

impl NoProgressWatcher {
    pub fn new(config: NoProgressWatcherConfig, probe: std::sync::Arc<dyn ProbeRunner>) -> Self {
        Self {
            config,
            probe,
            consecutive_stalls: AtomicU32::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_digest: Mutex::new(None),
        }
    }

    async fn poll(&self) -> Option<SentinelTrigger> {
        match self.probe.run().await {
            Ok(output) => {
                self.consecutive_errors.store(0, Ordering::SeqCst);
                match output.class {
                    ProbeClass::Progressing => {
                        self.consecutive_stalls.store(0, Ordering::SeqCst);
                        *self.last_digest.lock().unwrap() = output.digest;
                        None
                    }
                    ProbeClass::Stalled => {
                        let mut last = self.last_digest.lock().unwrap();
                        if *last == output.digest {
                            let count = self.consecutive_stalls.fetch_add(1, Ordering::SeqCst) + 1;
                            if count >= self.config.stall_threshold {
                                return Some(SentinelTrigger {
                                    kind: StallKind::Progress,
                                    fingerprints: vec!["stall/probe-stalled".to_string()],
                                    reason: format!(
                                        "probe digest unchanged for {} consecutive stalls",
                                        count
                                    ),
                                });
                            }
                        } else {
                            self.consecutive_stalls.store(1, Ordering::SeqCst);
                            *last = output.digest;
                        }
                        None
                    }
                    ProbeClass::Terminal => Some(SentinelTrigger {
                        kind: StallKind::ProbeTerminal,
                        fingerprints: vec!["stall/terminal".to_string()],
                        reason: "probe reported terminal state".to_string(),
                    }),
                }
            }
            Err(e) => {
                let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                if count < self.config.probe_error_threshold {
                    return None;
                }
                match self.config.on_probe_error {
                    OnProbeError::Ignore => None,
                    OnProbeError::Stall => Some(SentinelTrigger {
                        kind: StallKind::Progress,
                        fingerprints: vec!["stall/probe-stalled".to_string()],
                        reason: format!("probe error threshold exceeded: {e}"),
                    }),
                    OnProbeError::Terminal => Some(SentinelTrigger {
                        kind: StallKind::ProbeTerminal,
                        fingerprints: vec!["stall/probe-terminal".to_string()],
                        reason: format!("probe error threshold exceeded: {e}"),
                    }),
                }
            }
        }
    }
}

/// Owns the activity tracker entry and watchers for one
/// `(stepId, iteration, phase)`. `start`/`stop` are idempotent; fires at
/// most once (spec §5: "ignore fires at most once per guard").
pub struct SentinelGuard {
    key: ActivityKey,
    tracker: std::sync::Arc<ActivityTracker>,
    abort: CancelToken,
    fired: AtomicBool,
    warned: AtomicBool,
    started_at: Instant,
    handle: Mutex<Option<JoinHandle<()>>>,
    probe_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SentinelGuard {
    pub fn new(key: ActivityKey, tracker: std::sync::Arc<ActivityTracker>, abort: CancelToken) -> Self {
        Self {
            key,
            tracker,
            abort,
            fired: AtomicBool::new(false),
            warned: AtomicBool::new(false),
            started_at: Instant::now(),
            handle: Mutex::new(None),
            probe_handle: Mutex::new(None),
        }
    }

    fn apply(&self, trigger: SentinelTrigger, action: SentinelAction) -> Option<SentinelTrigger> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        match action {
            SentinelAction::Interrupt => {
                let tag = trigger.fingerprints.join(",");
                let reason = CancelReason::Sentinel(tag);
                let abort = self.abort.clone();
                tokio::spawn(async move { abort.cancel(reason).await });
            }
            SentinelAction::Fail => {
                // Caller inspects the returned trigger to derive the
                // step's FAILED errorClass; no cancellation fired here.
            }
            SentinelAction::Ignore => {
                if !self.warned.swap(true, Ordering::SeqCst) {
                    warn!(reason = %trigger.reason, "sentinel guard ignoring stall trigger");
                }
            }
        }
        Some(trigger)
    }

    /// Starts polling with a `NoOutputWatcher`, returning triggers (and
    /// applying `action`) via a background task. Idempotent: a second
    /// `start` call is a no-op while already running.
    pub fn start_no_output(
        self: &std::sync::Arc<Self>,
        watcher: NoOutputWatcher,
        action: SentinelAction,
    ) {
        let mut guard = self.handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        let started_at = this.started_at;
        let poll_interval = watcher.config.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if this.fired.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(trigger) = watcher.poll(&this.tracker, this.key, started_at) {
                    this.apply(trigger, action);
                    break;
                }
            }
        });
        *guard = Some(handle);
    }

    /// Starts polling with a `NoProgressWatcher`, firing `watcher.config`'s
    /// `on_terminal_action` on the first stall or terminal trigger.
    /// Idempotent: a second `start` call is a no-op while already running.
    pub fn start_no_progress(self: &std::sync::Arc<Self>, watcher: NoProgressWatcher) {
        let mut guard = self.probe_handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        let interval = watcher.config.interval;
        let action = watcher.config.on_terminal_action;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.fired.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(trigger) = watcher.poll().await {
                    this.apply(trigger, action);
                    break;
                }
            }
        });
        *guard = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.probe_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.tracker.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_output_watcher_fires_with_no_initial_output_fingerprint() {
        let tracker = std::sync::Arc::new(ActivityTracker::new());
        let key = ActivityKey { step_id: 1, iteration: 0 };
        let abort = CancelToken::new();
        let guard = std::sync::Arc::new(SentinelGuard::new(key, tracker.clone(), abort.clone()));

        let watcher = NoOutputWatcher::new(NoOutputWatcherConfig {
            poll_interval: Duration::from_millis(10),
            no_output_timeout: Duration::from_millis(100),
            activity_source: ActivitySource::AnyEvent,
        });
        guard.start_no_output(watcher, SentinelAction::Interrupt);

        abort.cancelled().await;
        assert_eq!(abort.reason().await, Some(CancelReason::Sentinel("stall/no-output,stall/no-initial-output".to_string())));
    }

    struct StallingProbe;

    #[async_trait]
    impl ProbeRunner for StallingProbe {
        async fn run(&self) -> Result<ProbeOutput, anyhow::Error> {
            Ok(ProbeOutput {
                class: ProbeClass::Stalled,
                digest: Some("same".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn no_progress_watcher_fires_after_stall_threshold() {
        let watcher = NoProgressWatcher::new(
            NoProgressWatcherConfig {
                interval: Duration::from_millis(5),
                stall_threshold: 3,
                probe_error_threshold: 1,
                on_probe_error: OnProbeError::Ignore,
                on_terminal_action: SentinelAction::Interrupt,
            },
            std::sync::Arc::new(StallingProbe),
        );
        assert!(watcher.poll().await.is_none());
        assert!(watcher.poll().await.is_none());
        let trigger = watcher.poll().await.expect("third stall should fire");
        assert_eq!(trigger.fingerprints, vec!["stall/probe-stalled".to_string()]);
    }

    struct TerminalProbe;

    #[async_trait]
    impl ProbeRunner for TerminalProbe {
        async fn run(&self) -> Result<ProbeOutput, anyhow::Error> {
            Ok(ProbeOutput {
                class: ProbeClass::Terminal,
                digest: None,
            })
        }
    }

    #[tokio::test]
    async fn command_probe_runner_parses_stdout_json() {
        let manager = std::sync::Arc::new(ProcessManager::new());
        let runner = CommandProbeRunner::new(
            manager,
            "echo".to_string(),
            vec![r#"{"class":"progressing","digest":"abc"}"#.to_string()],
            std::env::temp_dir(),
            5_000,
        );
        let output = runner.run().await.expect("probe should succeed");
        assert_eq!(output.class, ProbeClass::Progressing);
        assert_eq!(output.digest, Some("abc".to_string()));
    }

    #[tokio::test]
    async fn command_probe_runner_rejects_non_json_stdout() {
        let manager = std::sync::Arc::new(ProcessManager::new());
        let runner = CommandProbeRunner::new(
            manager,
            "echo".to_string(),
            vec!["not json".to_string()],
            std::env::temp_dir(),
            5_000,
        );
        assert!(runner.run().await.is_err());
    }

    #[tokio::test]
    async fn terminal_probe_class_fires_immediately() {
        let watcher = NoProgressWatcher::new(
            NoProgressWatcherConfig {
                interval: Duration::from_millis(5),
                stall_threshold: 3,
                probe_error_threshold: 1,
                on_probe_error: OnProbeError::Ignore,
                on_terminal_action: SentinelAction::Interrupt,
            },
            std::sync::Arc::new(TerminalProbe),
        );
        let trigger = watcher.poll().await.expect("terminal should fire immediately");
        assert_eq!(trigger.kind, StallKind::ProbeTerminal);
    }
}
