//! BackpressureController (spec §4.3).

use crate::config::BackpressureConfig;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub active_permits: u64,
    pub queue_depth: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackpressureResponse {
    Allow,
    Degrade,
    Defer,
    Reject,
}

pub struct BackpressureController {
    config: BackpressureConfig,
    last_observed: Mutex<LoadMetrics>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            last_observed: Mutex::new(LoadMetrics::default()),
        }
    }

    /// Side-effect free beyond updating the current vector.
    pub fn update_metrics(&self, metrics: LoadMetrics) {
        *self.last_observed.lock().unwrap() = metrics;
    }

    fn current_load(&self) -> f64 {
        let metrics = *self.last_observed.lock().unwrap();
        let permits_ratio = metrics.active_permits as f64 / self.config.max_permits_norm;
        let queue_ratio = metrics.queue_depth as f64 / self.config.max_queue_norm;
        let latency_ratio = metrics.avg_latency_ms / self.config.max_latency_ms_norm;
        permits_ratio.max(queue_ratio).max(latency_ratio)
    }

    /// Pure over the last-observed vector.
    pub fn check(&self) -> BackpressureResponse {
        let load = self.current_load();
        if load >= self.config.reject_threshold {
            BackpressureResponse::Reject
        } else if load >= self.config.defer_threshold {
            BackpressureResponse::Defer
        } else if load >= self.config.degrade_threshold {
            BackpressureResponse::Degrade
        } else {
            BackpressureResponse::Allow
        }
    }

    pub fn load_summary(&self) -> String {
        let metrics = *self.last_observed.lock().unwrap();
        format!(
            "activePermits={} queueDepth={} avgLatencyMs={:.1} load={:.3}",
            metrics.active_permits,
            metrics.queue_depth,
            metrics.avg_latency_ms,
            self.current_load()
        )
    }
}
