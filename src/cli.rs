//! Command-line surface (ambient expansion §10.4): clap derive struct
//! mirroring the teacher's `command.rs` top-level dispatch, generalized
//! from golem-cli's namespace tree to this crate's flatter subcommand set.

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "agentcore", version, about = "Execution-control runtime for AI coding agent fleets")]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,

    /// Path to a TOML configuration file (overrides $AGENTCORE_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Shared admission-control flags, applied to `run`, `workflow`, and
/// `daemon` (spec §10.4).
#[derive(Debug, Clone, clap::Args)]
pub struct BudgetArgs {
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    #[arg(long)]
    pub max_rps: Option<u32>,
    #[arg(long)]
    pub max_cost_budget: Option<f64>,
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the JSON-Lines IPC server (spec §4.12).
    Serve {
        #[command(flatten)]
        budget: BudgetArgs,
        /// Listen on a Unix domain socket instead of stdio.
        #[arg(long)]
        socket_path: Option<PathBuf>,
        /// Listen on a TCP host:port instead of stdio (requires --tcp-port).
        #[arg(long, requires = "tcp_port")]
        tcp_host: Option<String>,
        #[arg(long, requires = "tcp_host")]
        tcp_port: Option<u16>,
    },
    /// Dispatch a single worker task and exit (spec §6 "one-shot run mode").
    Run {
        #[arg(long, value_enum)]
        worker: WorkerKindArg,
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        model: Option<String>,
        /// Comma-separated subset of READ,EDIT,RUN_TESTS,RUN_COMMANDS.
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<CapabilityArg>,
        #[arg(long, default_value_t = 300_000)]
        timeout_ms: u64,
        #[command(flatten)]
        budget: BudgetArgs,
        instructions: String,
    },
    /// Load and execute a declarative workflow file.
    Workflow {
        file: PathBuf,
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        context_dir: PathBuf,
        #[command(flatten)]
        budget: BudgetArgs,
    },
    /// Load a daemon descriptor and run until interrupted.
    Daemon {
        file: PathBuf,
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        context_dir: PathBuf,
        #[command(flatten)]
        budget: BudgetArgs,
    },
    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum WorkerKindArg {
    Opencode,
    ClaudeCode,
    CodexCli,
    Custom,
}

impl From<WorkerKindArg> for crate::model::WorkerKind {
    fn from(value: WorkerKindArg) -> Self {
        match value {
            WorkerKindArg::Opencode => crate::model::WorkerKind::Opencode,
            WorkerKindArg::ClaudeCode => crate::model::WorkerKind::ClaudeCode,
            WorkerKindArg::CodexCli => crate::model::WorkerKind::CodexCli,
            WorkerKindArg::Custom => crate::model::WorkerKind::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CapabilityArg {
    Read,
    Edit,
    RunTests,
    RunCommands,
}

impl From<CapabilityArg> for crate::model::Capability {
    fn from(value: CapabilityArg) -> Self {
        match value {
            CapabilityArg::Read => crate::model::Capability::Read,
            CapabilityArg::Edit => crate::model::Capability::Edit,
            CapabilityArg::RunTests => crate::model::Capability::RunTests,
            CapabilityArg::RunCommands => crate::model::Capability::RunCommands,
        }
    }
}

impl BudgetArgs {
    /// Overlays any flags the user set on top of the config-file/env
    /// defaults (CLI flags win, per spec §10.3 layer order).
    pub fn apply(&self, base: &crate::config::BudgetConfig) -> crate::config::BudgetConfig {
        crate::config::BudgetConfig {
            max_concurrency: self.max_concurrency.unwrap_or(base.max_concurrency),
            max_rps: self.max_rps.unwrap_or(base.max_rps),
            max_cost_budget: self.max_cost_budget.or(base.max_cost_budget),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
        }
    }
}
