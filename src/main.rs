//! Process entry point: arg parsing, config loading, subcommand dispatch,
//! and the root exit-code mapping (spec §6 "CLI surface", §7).

use agentcore::cancel::CancelToken;
use agentcore::cli::{Cli, Command};
use agentcore::config::{Config, IpcTransportKind};
use agentcore::error::CoreError;
use agentcore::log::{init_tracing, LogFormat};
use agentcore::model::{Capability, WorkerKind};
use agentcore::runtime::{CoreRuntime, RunOptions};
use clap::{CommandFactory, Parser};
use clap_verbosity_flag::Level;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = if matches!(cli.command, Command::Serve { .. }) {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    let verbosity = match cli.verbosity.log_level() {
        None | Some(Level::Error) | Some(Level::Warn) => -1,
        Some(Level::Info) => 0,
        Some(Level::Debug) => 1,
        Some(Level::Trace) => 2,
    };
    init_tracing(log_format, verbosity);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(cli.command, config))
}

/// Outcome of one dispatched subcommand, distinct from `CoreError` so a
/// clean SIGINT doesn't get logged as if it were a failure.
enum MainOutcome {
    Success,
    Failure,
    Interrupted,
    Error(CoreError),
}

async fn async_main(command: Command, config: Config) -> ExitCode {
    let outcome = match command {
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            MainOutcome::Success
        }
        Command::Run {
            worker,
            workspace,
            model,
            capabilities,
            timeout_ms,
            budget,
            instructions,
        } => {
            let mut config = config;
            config.budget = budget.apply(&config.budget);
            let runtime = Arc::new(CoreRuntime::new(Arc::new(config)));
            let opts = RunOptions {
                worker_kind: WorkerKind::from(worker),
                workspace,
                instructions,
                model,
                capabilities: capabilities.into_iter().map(Capability::from).collect(),
                timeout_ms,
                max_attempts: 1,
                cost_hint: None,
            };
            match run_cancellable(&runtime, runtime.run_one_shot(opts)).await {
                Ok(result) => {
                    let status_word = format!("{:?}", result.status).to_uppercase();
                    eprintln!("{}", agentcore::log::colorize_status(log_format, &status_word));
                    match serde_json::to_string_pretty(&result) {
                        Ok(json) => println!("{json}"),
                        Err(e) => error!(error = %e, "failed to serialize worker result"),
                    }
                    if result.status == agentcore::model::WorkerStatus::Succeeded {
                        MainOutcome::Success
                    } else {
                        MainOutcome::Failure
                    }
                }
                Err(outcome) => outcome,
            }
        }
        Command::Workflow {
            file,
            workspace,
            context_dir,
            budget,
        } => {
            let mut config = config;
            config.budget = budget.apply(&config.budget);
            let runtime = Arc::new(CoreRuntime::new(Arc::new(config)));
            let result = run_cancellable(
                &runtime,
                runtime.run_workflow_file(&file, &workspace, &context_dir),
            )
            .await;
            match result {
                Ok(outcome) => {
                    info!(status = ?outcome.status, "workflow run complete");
                    if outcome.status == agentcore::workflow::WorkflowStatus::Succeeded {
                        MainOutcome::Success
                    } else {
                        MainOutcome::Failure
                    }
                }
                Err(outcome) => outcome,
            }
        }
        Command::Daemon {
            file,
            workspace,
            context_dir,
            budget,
        } => {
            let mut config = config;
            config.budget = budget.apply(&config.budget);
            let runtime = Arc::new(CoreRuntime::new(Arc::new(config)));
            runtime.start_watchdog();
            let cancel = CancelToken::new();
            let ctrl_c_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_token.cancel(agentcore::cancel::CancelReason::UserCancel).await;
                }
            });
            let result = runtime.run_daemon_file(&file, &workspace, &context_dir, cancel.clone()).await;
            runtime.shutdown().await;
            match result {
                Ok(()) if cancel.is_cancelled() => MainOutcome::Interrupted,
                Ok(()) => MainOutcome::Success,
                Err(e) => MainOutcome::Error(e),
            }
        }
        Command::Serve {
            budget,
            socket_path,
            tcp_host,
            tcp_port,
        } => {
            let mut config = config;
            config.budget = budget.apply(&config.budget);
            if let Some(path) = socket_path {
                config.ipc.transport = IpcTransportKind::UnixSocket;
                config.ipc.socket_path = Some(path.display().to_string());
            } else if let (Some(host), Some(port)) = (tcp_host, tcp_port) {
                config.ipc.transport = IpcTransportKind::Tcp;
                config.ipc.host = Some(host);
                config.ipc.port = Some(port);
            }
            let runtime = Arc::new(CoreRuntime::new(Arc::new(config)));
            runtime.start_watchdog();
            match serve(runtime.clone()).await {
                Ok(()) => MainOutcome::Interrupted,
                Err(e) => MainOutcome::Error(e),
            }
        }
    };

    match outcome {
        MainOutcome::Success => ExitCode::SUCCESS,
        MainOutcome::Failure => ExitCode::from(1),
        MainOutcome::Interrupted => ExitCode::from(130),
        MainOutcome::Error(e) => {
            error!(code = e.code(), error = %e, "agentcore exiting with error");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// Races a unit of work against SIGINT, invoking `runtime.shutdown()` and
/// reporting `MainOutcome::Interrupted` if the signal wins (spec §6 exit
/// code 130).
async fn run_cancellable<T>(
    runtime: &Arc<CoreRuntime>,
    work: impl std::future::Future<Output = Result<T, CoreError>>,
) -> Result<T, MainOutcome> {
    tokio::select! {
        result = work => result.map_err(MainOutcome::Error),
        ctrl_c = tokio::signal::ctrl_c() => {
            if ctrl_c.is_err() {
                error!("failed to install SIGINT handler");
            }
            runtime.shutdown().await;
            Err(MainOutcome::Interrupted)
        }
    }
}

/// Builds the JSON-Lines transport per the effective `IpcConfig` and runs
/// the server until SIGINT.
async fn serve(runtime: Arc<CoreRuntime>) -> Result<(), CoreError> {
    use agentcore::ipc_server::IpcServer;

    let cancel = CancelToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel(agentcore::cancel::CancelReason::UserCancel).await;
        }
    });

    match runtime.config.ipc.transport {
        IpcTransportKind::Stdio => {
            let server = IpcServer::new(runtime.clone(), tokio::io::stdin(), tokio::io::stdout());
            server.run(cancel).await;
        }
        IpcTransportKind::UnixSocket => {
            let path = runtime
                .config
                .ipc
                .socket_path
                .clone()
                .ok_or_else(|| CoreError::Other("unix socket transport requires a socket path".into()))?;
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path)
                .map_err(|e| CoreError::Other(format!("binding unix socket {path}: {e}")))?;
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| CoreError::Other(format!("accepting unix socket connection: {e}")))?;
            let (read, write) = stream.into_split();
            let server = IpcServer::new(runtime.clone(), read, write);
            server.run(cancel).await;
        }
        IpcTransportKind::Tcp => {
            let host = runtime.config.ipc.host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
            let port = runtime
                .config
                .ipc
                .port
                .ok_or_else(|| CoreError::Other("tcp transport requires a port".into()))?;
            let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                .await
                .map_err(|e| CoreError::Other(format!("binding tcp {host}:{port}: {e}")))?;
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| CoreError::Other(format!("accepting tcp connection: {e}")))?;
            let (read, write) = stream.into_split();
            let server = IpcServer::new(runtime.clone(), read, write);
            server.run(cancel).await;
        }
    }

    runtime.shutdown().await;
    Ok(())
}
