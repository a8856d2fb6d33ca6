//! Layered configuration (ambient expansion §10.3).
//!
//! Parsed once at startup into an immutable value threaded through
//! component constructors, per spec §9's "Global configuration" note.
//! Layer order: built-in defaults → optional TOML file → environment
//! (both `AGENTCORE_*` and `ROBOPPI_*` prefixes) → CLI flags.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_concurrency: usize,
    pub max_rps: u32,
    pub max_cost_budget: Option<f64>,
    pub max_attempts: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_rps: 100,
            max_cost_budget: None,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(30_000),
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub max_permits_norm: f64,
    pub max_queue_norm: f64,
    pub max_latency_ms_norm: f64,
    pub reject_threshold: f64,
    pub defer_threshold: f64,
    pub degrade_threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_permits_norm: 100.0,
            max_queue_norm: 1000.0,
            max_latency_ms_norm: 10_000.0,
            reject_threshold: 1.0,
            defer_threshold: 0.8,
            degrade_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcTransportKind {
    Stdio,
    UnixSocket,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub transport: IpcTransportKind,
    pub socket_path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub keepalive: bool,
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    pub component: String,
    #[serde(with = "humantime_serde")]
    pub default_response_timeout: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            transport: IpcTransportKind::Stdio,
            socket_path: None,
            host: None,
            port: None,
            keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            component: "agentcore".to_string(),
            default_response_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backpressure: BackpressureConfig,
    pub ipc: IpcConfig,
    #[serde(with = "humantime_serde")]
    pub watchdog_interval: Duration,
    pub acquire_lock_timeout_ms: u64,
    pub worker_cancel_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
            ipc: IpcConfig::default(),
            watchdog_interval: Duration::from_secs(1),
            acquire_lock_timeout_ms: 30_000,
            worker_cancel_grace_ms: 5_000,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional TOML file, then the
    /// environment (accepting both `AGENTCORE_` and `ROBOPPI_` prefixes).
    pub fn load(file: Option<&std::path::Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment
            .merge(Env::prefixed("AGENTCORE_").split("__"))
            .merge(Env::prefixed("ROBOPPI_").split("__"));

        figment.extract()
    }
}
