//! Persisted workflow execution layout (spec §6 "Persisted layout").

use crate::workflow::dag::WorkflowDef;
use crate::workflow::step::{StepOutcome, StepStatus};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct WorkflowMeta<'a> {
    workflow_id: &'a str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct StepMeta<'a> {
    status: &'static str,
    worker_kind: &'a str,
    iterations: u32,
    error_class: Option<String>,
}

fn status_name(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "PENDING",
        StepStatus::Ready => "READY",
        StepStatus::Running => "RUNNING",
        StepStatus::Checking => "CHECKING",
        StepStatus::Succeeded => "SUCCEEDED",
        StepStatus::Failed => "FAILED",
        StepStatus::Cancelled => "CANCELLED",
        StepStatus::Skipped => "SKIPPED",
        StepStatus::Incomplete => "INCOMPLETE",
    }
}

/// Writes the per-workflow persisted layout rooted at `context_dir`.
pub struct WorkflowPersistence {
    context_dir: PathBuf,
}

impl WorkflowPersistence {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
        }
    }

    pub fn write_workflow_meta(&self, def: &WorkflowDef, status: &'static str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.context_dir)?;
        let meta = WorkflowMeta {
            workflow_id: &def.workflow_id,
            status,
        };
        let path = self.context_dir.join("_workflow.json");
        std::fs::write(path, serde_json::to_vec_pretty(&meta)?)
    }

    pub fn write_step_meta(&self, step_id: &str, worker_kind: &str, outcome: &StepOutcome) -> std::io::Result<()> {
        let dir = self.context_dir.join(step_id);
        std::fs::create_dir_all(&dir)?;
        let meta = StepMeta {
            status: status_name(outcome.status),
            worker_kind,
            iterations: outcome.iterations,
            error_class: outcome.error_class.map(|e| format!("{e:?}")),
        };
        std::fs::write(dir.join("_meta.json"), serde_json::to_vec_pretty(&meta)?)
    }

    /// Copies a producer's artifact directory into `workspace/<targetName>`
    /// (spec §4.11 step 1: materialize workspace inputs).
    pub fn materialize_input(&self, producer_step_id: &str, artifact: &str, workspace: &Path, target_name: &str) -> std::io::Result<()> {
        let source = self.context_dir.join(producer_step_id).join(artifact);
        let dest = workspace.join(target_name);
        copy_dir(&source, &dest)
    }

    /// Copies a declared output path from the worker's workspace into
    /// `context/<stepId>/<artifactName>/` (spec §4.11 step 5).
    pub fn collect_output(&self, step_id: &str, artifact_name: &str, source_path: &Path) -> std::io::Result<()> {
        let dest = self.context_dir.join(step_id).join(artifact_name);
        copy_dir(source_path, &dest)
    }

    pub fn append_probe_record(&self, step_id: &str, record: &serde_json::Value) -> std::io::Result<()> {
        let dir = self.context_dir.join(step_id).join("_stall");
        std::fs::create_dir_all(&dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("probe.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(record)?)
    }
}

fn copy_dir(source: &Path, dest: &Path) -> std::io::Result<()> {
    if !source.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source).unwrap();
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::dag::WorkflowDef;

    #[test]
    fn writes_workflow_and_step_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let persistence = WorkflowPersistence::new(tmp.path());
        let def = WorkflowDef {
            workflow_id: "wf-1".to_string(),
            steps: Vec::new(),
            timeout: std::time::Duration::from_secs(1),
            concurrency: None,
        };
        persistence.write_workflow_meta(&def, "SUCCEEDED").unwrap();
        assert!(tmp.path().join("_workflow.json").exists());

        persistence
            .write_step_meta("step-a", "CUSTOM", &StepOutcome::pending())
            .unwrap();
        assert!(tmp.path().join("step-a/_meta.json").exists());
    }

    #[test]
    fn materialize_and_collect_copy_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let persistence = WorkflowPersistence::new(tmp.path());

        let output_src = tmp.path().join("worker-ws/out");
        std::fs::create_dir_all(&output_src).unwrap();
        std::fs::write(output_src.join("file.txt"), b"hello").unwrap();
        persistence.collect_output("step-a", "patches", &output_src).unwrap();
        assert!(tmp.path().join("step-a/patches/file.txt").exists());

        let next_workspace = tmp.path().join("worker-ws-2");
        std::fs::create_dir_all(&next_workspace).unwrap();
        persistence
            .materialize_input("step-a", "patches", &next_workspace, "patches")
            .unwrap();
        assert!(next_workspace.join("patches/file.txt").exists());
    }
}
