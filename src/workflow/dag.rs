//! Workflow DAG definition and validation (spec §3 "Workflow DAG", §6
//! "Reserved names").

use crate::error::ValidationError;
use crate::model::{Capability, WorkerKind};
use crate::sentinel::{OnProbeError, SentinelAction};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const RESERVED_NAMES: &[&str] = &[
    "_workflow",
    "_subworkflows",
    "_meta.json",
    "_resolved.json",
    "_convergence",
    "_stall",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFailure {
    Retry,
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnIterationsExhausted {
    Abort,
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    pub from: String,
    pub artifact: String,
    #[serde(default, rename = "as")]
    pub as_name: Option<String>,
}

impl InputSpec {
    pub fn target_name(&self) -> &str {
        self.as_name.as_deref().unwrap_or(&self.artifact)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionCheckConfig {
    /// Command invoked in the step's workspace after each successful run.
    /// Exit code 0 means the step's goal is met; non-zero means incomplete.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub max_iterations: u32,
    pub on_iterations_exhausted: OnIterationsExhausted,
}

/// Per-step NoProgressWatcher configuration (spec §4.11 "NoProgressWatcher").
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    pub stall_threshold: u32,
    #[serde(default = "default_probe_error_threshold")]
    pub probe_error_threshold: u32,
    #[serde(default)]
    pub on_probe_error: OnProbeError,
    #[serde(default)]
    pub action: SentinelAction,
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_probe_error_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    pub step_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    pub worker_kind: WorkerKind,
    pub instructions: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Declared output artifact names, collected into
    /// `context/<stepId>/<artifactName>/` on success.
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(default = "default_on_failure")]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub completion_check: Option<CompletionCheckConfig>,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
    pub timeout_ms: u64,
}

fn default_on_failure() -> OnFailure {
    OnFailure::Abort
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDef {
    pub workflow_id: String,
    pub steps: Vec<StepDef>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl WorkflowDef {
    /// Parses a workflow definition from YAML. Malformed input fails fast
    /// with `ValidationError::InvalidWorkflow` rather than attempting any
    /// semantic recovery (spec §10.4).
    pub fn from_yaml(input: &str) -> Result<Self, ValidationError> {
        serde_yaml::from_str(input)
            .map_err(|e| ValidationError::InvalidWorkflow(format!("workflow definition: {e}")))
    }
}

impl WorkflowDef {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for step in &self.steps {
            if RESERVED_NAMES.contains(&step.step_id.as_str()) {
                return Err(ValidationError::ReservedId(step.step_id.clone()));
            }
        }

        let ids: HashSet<&str> = self.steps.iter().map(|s| s.step_id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ValidationError::InvalidWorkflow(format!(
                        "step {} depends on unknown step {}",
                        step.step_id, dep
                    )));
                }
            }
        }

        self.detect_cycle()
    }

    fn detect_cycle(&self) -> Result<(), ValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let by_id: HashMap<&str, &StepDef> =
            self.steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
        let mut marks: HashMap<&str, Mark> =
            self.steps.iter().map(|s| (s.step_id.as_str(), Mark::Unvisited)).collect();

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a StepDef>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<String>,
        ) -> Result<(), ValidationError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    stack.push(id.to_string());
                    return Err(ValidationError::CyclicDependency(stack.clone()));
                }
                _ => {}
            }
            marks.insert(id, Mark::InProgress);
            stack.push(id.to_string());
            if let Some(step) = by_id.get(id) {
                for dep in &step.depends_on {
                    visit(dep, by_id, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for step in &self.steps {
            let mut stack = Vec::new();
            visit(&step.step_id, &by_id, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            timeout_ms: 5000,
        }
    }

    #[test]
    fn rejects_reserved_step_ids() {
        let def = WorkflowDef {
            workflow_id: "w".to_string(),
            steps: vec![step("_stall", &[])],
            timeout: Duration::from_secs(10),
            concurrency: None,
        };
        assert!(matches!(def.validate(), Err(ValidationError::ReservedId(_))));
    }

    #[test]
    fn detects_cycle() {
        let def = WorkflowDef {
            workflow_id: "w".to_string(),
            steps: vec![step("a", &["b"]), step("b", &["a"])],
            timeout: Duration::from_secs(10),
            concurrency: None,
        };
        assert!(matches!(def.validate(), Err(ValidationError::CyclicDependency(_))));
    }

    #[test]
    fn accepts_valid_dag() {
        let def = WorkflowDef {
            workflow_id: "w".to_string(),
            steps: vec![step("a", &[]), step("b", &["a"])],
            timeout: Duration::from_secs(10),
            concurrency: None,
        };
        assert!(def.validate().is_ok());
    }
}
