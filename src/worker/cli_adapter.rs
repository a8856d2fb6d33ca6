//! Process-based worker adapter shared by all external CLI worker kinds
//! (spec §4.6). Grounded directly on the teacher's `process.rs`
//! (`CommandExt::stream_output`'s `tokio::spawn`-per-stream draining loop
//! over `BufReader::lines()`), generalized from "print lines prefixed with
//! the command name" into "parse each line as a tagged worker event".

use super::WorkerAdapter;
use crate::cancel::CancelToken;
use crate::error::{classify_worker_failure, WorkerError};
use crate::ids::WorkerHandleId;
use crate::model::{
    Artifact, ArtifactKind, ErrorClass, Observation, WorkerEvent, WorkerHandle, WorkerKind,
    WorkerResult, WorkerStatus, WorkerTask,
};
use crate::process_manager::{ProcessManager, SpawnOptions};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

const COMPLETION_MARKERS: [&str; 4] = ["COMPLETE", "INCOMPLETE", "FAIL", "FAILED"];
const SUMMARY_HEAD_TAIL_CHARS: usize = 1000;
const SUMMARY_MAX_CHARS: usize = 4000;

struct RunningTask {
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    buffered_stdout_lines: Mutex<Vec<String>>,
    exit_code: tokio::sync::Mutex<Option<i32>>,
    exit_notify: tokio::sync::Notify,
    pid: u32,
    started_at: std::time::Instant,
    abort: CancelToken,
}

/// Command-line contract per spec §6: `<cmd> run --format json [extra
/// flags...] <instructions>`.
pub struct CliWorkerAdapter {
    kind: WorkerKind,
    command: String,
    extra_args: Vec<String>,
    process_manager: Arc<ProcessManager>,
    cancel_grace_ms: u64,
    tasks: dashmap::DashMap<WorkerHandleId, Arc<RunningTask>>,
}

impl CliWorkerAdapter {
    pub fn new(
        kind: WorkerKind,
        command: impl Into<String>,
        process_manager: Arc<ProcessManager>,
    ) -> Self {
        Self {
            kind,
            command: command.into(),
            extra_args: Vec::new(),
            process_manager,
            cancel_grace_ms: 5_000,
            tasks: dashmap::DashMap::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn build_args(&self, task: &WorkerTask) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--format".to_string(), "json".to_string()];
        args.extend(self.extra_args.clone());
        if let Some(model) = &task.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(task.instructions.clone());
        args
    }
}

fn parse_tagged_line(line: &str) -> WorkerEvent {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) if value.is_object() => {
            let kind = value.get("type").and_then(|v| v.as_str());
            match kind {
                Some("progress") => WorkerEvent::Progress(value),
                Some("patch") => {
                    let file_path = value
                        .get("filePath")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let diff = value
                        .get("diff")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    WorkerEvent::Patch { file_path, diff }
                }
                _ => WorkerEvent::Stdout(line.to_string()),
            }
        }
        _ => WorkerEvent::Stdout(line.to_string()),
    }
}

fn extract_artifacts_and_observations(lines: &[String]) -> (Vec<Artifact>, Vec<Observation>) {
    let mut artifacts = Vec::new();
    let mut observations = Vec::new();

    for line in lines {
        let upper = line.to_uppercase();
        let has_completion_marker = COMPLETION_MARKERS.iter().any(|m| upper.contains(m));

        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) if value.is_object() => {
                match value.get("type").and_then(|v| v.as_str()) {
                    Some("patch") => {
                        artifacts.push(Artifact {
                            kind: ArtifactKind::Patch,
                            file_path: value
                                .get("filePath")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            diff: value
                                .get("diff")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                        });
                    }
                    Some("file_change") => {
                        artifacts.push(Artifact {
                            kind: ArtifactKind::Patch,
                            file_path: value
                                .get("path")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            diff: None,
                        });
                    }
                    Some("result") => {
                        observations.push(Observation {
                            summary: value
                                .get("result")
                                .map(|v| v.to_string())
                                .unwrap_or_default(),
                            detail: Some(value.clone()),
                        });
                    }
                    Some("observation") => {
                        observations.push(Observation {
                            summary: value
                                .get("summary")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            detail: Some(value.clone()),
                        });
                    }
                    _ if has_completion_marker => {
                        observations.push(Observation {
                            summary: line.clone(),
                            detail: None,
                        });
                    }
                    _ => {}
                }
            }
            _ if has_completion_marker => {
                observations.push(Observation {
                    summary: line.clone(),
                    detail: None,
                });
            }
            _ => {}
        }
    }

    if observations.is_empty() && !lines.is_empty() {
        let joined = lines.join("\n");
        if joined.len() > SUMMARY_MAX_CHARS {
            let head: String = joined.chars().take(SUMMARY_HEAD_TAIL_CHARS).collect();
            let tail: String = joined
                .chars()
                .rev()
                .take(SUMMARY_HEAD_TAIL_CHARS)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            observations.push(Observation {
                summary: format!("{head}...{tail}"),
                detail: None,
            });
        } else {
            observations.push(Observation {
                summary: joined,
                detail: None,
            });
        }
    }

    (artifacts, observations)
}

#[async_trait]
impl WorkerAdapter for CliWorkerAdapter {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn start_task(&self, task: WorkerTask) -> Result<WorkerHandle, WorkerError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let timeout_ms = (task.budget.deadline_at_ms - now_ms).max(0) as u64;

        let abort = task.abort.clone();
        let args = self.build_args(&task);

        let managed = self
            .process_manager
            .spawn(SpawnOptions {
                command: self.command.clone(),
                args,
                cwd: Some(task.workspace_ref.clone()),
                env: task.env.clone(),
                abort: Some(abort.clone()),
                timeout_ms: Some(timeout_ms),
                process_group: true,
            })
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(RunningTask {
            events_rx: Mutex::new(Some(rx)),
            buffered_stdout_lines: Mutex::new(Vec::new()),
            exit_code: tokio::sync::Mutex::new(None),
            exit_notify: tokio::sync::Notify::new(),
            pid: managed.pid,
            started_at: std::time::Instant::now(),
            abort: abort.clone(),
        });

        let handle_id = WorkerHandleId::new();
        self.tasks.insert(handle_id, running.clone());

        let stdout = managed.stdout.lock().await.take();
        let stderr = managed.stderr.lock().await.take();

        if let Some(stdout) = stdout {
            let tx = tx.clone();
            let running = running.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    running.buffered_stdout_lines.lock().await.push(line.clone());
                    let event = parse_tagged_line(&line);
                    let _ = tx.send(event);
                }
            });
        }

        if let Some(stderr) = stderr {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(WorkerEvent::Stderr(line));
                }
            });
        }

        let running_for_exit = running.clone();
        tokio::spawn(async move {
            let code = managed.wait_exit_code().await;
            *running_for_exit.exit_code.lock().await = Some(code);
            running_for_exit.exit_notify.notify_waiters();
        });

        Ok(WorkerHandle {
            handle_id,
            worker_kind: self.kind,
            abort,
        })
    }

    fn stream_events(&self, handle: &WorkerHandle) -> BoxStream<'static, WorkerEvent> {
        let Some(running) = self.tasks.get(&handle.handle_id).map(|e| e.clone()) else {
            return Box::pin(futures::stream::empty());
        };
        Box::pin(async_stream::stream! {
            let mut guard = running.events_rx.lock().await;
            if let Some(rx) = guard.as_mut() {
                while let Some(event) = rx.recv().await {
                    yield event;
                }
            }
        })
    }

    async fn cancel(&self, handle: &WorkerHandle) {
        if let Some(running) = self.tasks.get(&handle.handle_id) {
            self.process_manager
                .graceful_shutdown(running.pid, self.cancel_grace_ms)
                .await;
        }
    }

    async fn await_result(&self, handle: WorkerHandle) -> WorkerResult {
        let Some(running) = self.tasks.get(&handle.handle_id).map(|e| e.clone()) else {
            return WorkerResult::failed(std::time::Duration::ZERO, ErrorClass::NonRetryable);
        };

        loop {
            if let Some(code) = *running.exit_code.lock().await {
                let duration = running.started_at.elapsed();
                let lines = running.buffered_stdout_lines.lock().await.clone();
                let (artifacts, observations) = extract_artifacts_and_observations(&lines);

                let mut result = if code == 0 {
                    WorkerResult::succeeded(duration)
                } else if running.abort.is_cancelled() {
                    WorkerResult::cancelled(duration)
                } else if code == 137 || code == 143 {
                    WorkerResult::failed(duration, ErrorClass::RetryableTransient)
                } else {
                    let tail: String = lines
                        .iter()
                        .rev()
                        .take(20)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("\n");
                    WorkerResult::failed(duration, classify_worker_failure(Some(code), &tail))
                };

                result.artifacts = artifacts;
                result.observations = observations;

                self.tasks.remove(&handle.handle_id);
                return result;
            }
            running.exit_notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_and_patch_tagged_lines() {
        let progress = parse_tagged_line(r#"{"type":"progress","pct":50}"#);
        assert!(matches!(progress, WorkerEvent::Progress(_)));

        let patch = parse_tagged_line(r#"{"type":"patch","filePath":"a.rs","diff":"+1"}"#);
        match patch {
            WorkerEvent::Patch { file_path, diff } => {
                assert_eq!(file_path, "a.rs");
                assert_eq!(diff, "+1");
            }
            _ => panic!("expected patch event"),
        }
    }

    #[test]
    fn non_json_line_is_opaque_stdout() {
        let event = parse_tagged_line("plain text output");
        assert!(matches!(event, WorkerEvent::Stdout(_)));
    }

    #[test]
    fn completion_marker_preserved_even_without_structured_observations() {
        let lines = vec!["working...".to_string(), "Task COMPLETE".to_string()];
        let (_, observations) = extract_artifacts_and_observations(&lines);
        assert!(observations.iter().any(|o| o.summary.contains("COMPLETE")));
    }

    #[test]
    fn large_unstructured_stdout_gets_bounded_summary() {
        let big_line = "x".repeat(SUMMARY_MAX_CHARS + 500);
        let lines = vec![big_line];
        let (_, observations) = extract_artifacts_and_observations(&lines);
        assert_eq!(observations.len(), 1);
        assert!(observations[0].summary.contains("..."));
        assert!(observations[0].summary.len() < SUMMARY_MAX_CHARS + 10);
    }
}
