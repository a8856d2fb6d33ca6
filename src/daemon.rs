//! Daemon descriptor loading and event-source wiring (ambient expansion
//! §10.4). Event sources beyond `periodic_command` and `manual_trigger`
//! are out of scope (spec §1); a daemon descriptor that declares one is
//! accepted but logs a warning and never fires.

use crate::cancel::CancelToken;
use crate::error::ValidationError;
use crate::workflow::{WorkflowDef, WorkflowExecutor};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSource {
    PeriodicCommand {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    ManualTrigger,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonDef {
    pub daemon_id: String,
    pub source: EventSource,
    pub workflow: WorkflowDef,
}

impl DaemonDef {
    /// Parses a daemon descriptor from YAML, failing fast on malformed
    /// input with no attempt at semantic recovery (spec §10.4).
    pub fn from_yaml(input: &str) -> Result<Self, ValidationError> {
        serde_yaml::from_str(input)
            .map_err(|e| ValidationError::InvalidWorkflow(format!("daemon descriptor: {e}")))
    }
}

/// Binds one `DaemonDef` to a `WorkflowExecutor`, driving it from its
/// declared event source until `cancel` fires.
pub struct DaemonRunner {
    def: DaemonDef,
    executor: Arc<WorkflowExecutor>,
    workspace_root: PathBuf,
    context_root: PathBuf,
}

impl DaemonRunner {
    pub fn new(
        def: DaemonDef,
        executor: Arc<WorkflowExecutor>,
        workspace_root: impl Into<PathBuf>,
        context_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            def,
            executor,
            workspace_root: workspace_root.into(),
            context_root: context_root.into(),
        }
    }

    pub async fn run(&self, cancel: CancelToken) {
        match &self.def.source {
            EventSource::PeriodicCommand { interval } => {
                let mut ticker = tokio::time::interval(*interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => self.fire_once().await,
                    }
                }
            }
            EventSource::ManualTrigger => {
                self.fire_once().await;
                cancel.cancelled().await;
            }
            EventSource::Unsupported => {
                warn!(
                    daemon_id = %self.def.daemon_id,
                    "daemon descriptor declares an unsupported event source kind, no-op"
                );
                cancel.cancelled().await;
            }
        }
    }

    async fn fire_once(&self) {
        let context_dir = self.context_root.join(&self.def.workflow.workflow_id);
        match self
            .executor
            .run(self.def.workflow.clone(), &self.workspace_root, &context_dir)
            .await
        {
            Ok(outcome) => info!(
                daemon_id = %self.def.daemon_id,
                status = ?outcome.status,
                "daemon workflow run complete"
            ),
            Err(e) => warn!(daemon_id = %self.def.daemon_id, error = %e, "daemon workflow run failed validation"),
        }
    }
}

pub fn load_daemon_def(path: &Path) -> Result<DaemonDef, ValidationError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::BadArgument(format!("reading {}: {e}", path.display())))?;
    DaemonDef::from_yaml(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_periodic_command_descriptor() {
        let yaml = r#"
daemonId: d-1
source:
  kind: periodic_command
  interval: 5s
workflow:
  workflowId: w-1
  timeout: 60s
  steps: []
"#;
        let def = DaemonDef::from_yaml(yaml).unwrap();
        assert!(matches!(def.source, EventSource::PeriodicCommand { .. }));
    }

    #[test]
    fn unsupported_source_kind_parses_as_unsupported_variant() {
        let yaml = r#"
daemonId: d-2
source:
  kind: webhook
workflow:
  workflowId: w-2
  timeout: 60s
  steps: []
"#;
        let def = DaemonDef::from_yaml(yaml).unwrap();
        assert!(matches!(def.source, EventSource::Unsupported));
    }

    #[test]
    fn malformed_yaml_fails_fast() {
        let err = DaemonDef::from_yaml("not: [valid").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWorkflow(_)));
    }
}
