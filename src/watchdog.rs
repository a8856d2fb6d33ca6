//! Watchdog (spec §4.9): periodic metric-driven defense-level classifier.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetricLevel {
    Normal,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenseLevel {
    Normal,
    Shed,
    Throttle,
    CircuitOpen,
    Escalation,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricThresholds {
    pub warn: f64,
    pub critical: f64,
}

impl MetricThresholds {
    fn classify(&self, value: f64) -> MetricLevel {
        if value >= self.critical {
            MetricLevel::Critical
        } else if value >= self.warn {
            MetricLevel::Warn
        } else {
            MetricLevel::Normal
        }
    }
}

/// Default thresholds covering worker inflight count, queue lag, worker
/// timeout rate, cancel latency, workspace-lock wait (spec §4.9).
pub fn default_thresholds() -> HashMap<String, MetricThresholds> {
    let mut m = HashMap::new();
    m.insert(
        "worker_inflight_count".to_string(),
        MetricThresholds { warn: 50.0, critical: 100.0 },
    );
    m.insert(
        "queue_lag_ms".to_string(),
        MetricThresholds { warn: 2000.0, critical: 8000.0 },
    );
    m.insert(
        "worker_timeout_rate".to_string(),
        MetricThresholds { warn: 0.1, critical: 0.3 },
    );
    m.insert(
        "cancel_latency_ms".to_string(),
        MetricThresholds { warn: 1000.0, critical: 5000.0 },
    );
    m.insert(
        "workspace_lock_wait_ms".to_string(),
        MetricThresholds { warn: 2000.0, critical: 10000.0 },
    );
    m
}

/// A fallible metric source. A source that errors is skipped for that
/// tick, not treated as fatal (spec §4.9, §7 "Watchdog survives throwing
/// metric sources").
pub trait MetricSource: Send + Sync {
    fn collect(&self) -> Result<HashMap<String, f64>, anyhow::Error>;
}

impl<F> MetricSource for F
where
    F: Fn() -> Result<HashMap<String, f64>, anyhow::Error> + Send + Sync,
{
    fn collect(&self) -> Result<HashMap<String, f64>, anyhow::Error> {
        (self)()
    }
}

pub type OnLevelChange = Box<dyn Fn(&str, MetricLevel) + Send + Sync>;

struct Tracked {
    level: MetricLevel,
    ticks_absent: u32,
}

pub struct Watchdog {
    interval: Duration,
    thresholds: HashMap<String, MetricThresholds>,
    sources: Vec<Arc<dyn MetricSource>>,
    last_fired: DashMap<String, Tracked>,
    on_change: std::sync::Mutex<Vec<OnLevelChange>>,
    running: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(interval: Duration, thresholds: HashMap<String, MetricThresholds>) -> Self {
        Self {
            interval,
            thresholds,
            sources: Vec::new(),
            last_fired: DashMap::new(),
            on_change: std::sync::Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn MetricSource>) {
        self.sources.push(source);
    }

    pub fn on_level_change(&self, cb: OnLevelChange) {
        self.on_change.lock().unwrap().push(cb);
    }

    /// Runs one tick synchronously: collects every source, classifies,
    /// fires callbacks for metrics whose level changed, prunes metrics
    /// absent for three consecutive ticks, and returns the system-wide
    /// `DefenseLevel` (spec §4.9 table).
    pub fn tick(&self) -> DefenseLevel {
        let mut seen = HashMap::new();
        for source in &self.sources {
            match source.collect() {
                Ok(metrics) => seen.extend(metrics),
                Err(e) => warn!(error = %e, "watchdog metric source failed, skipping"),
            }
        }

        for (name, value) in &seen {
            let Some(thresholds) = self.thresholds.get(name) else {
                continue;
            };
            let level = thresholds.classify(*value);
            let changed = match self.last_fired.get(name) {
                Some(tracked) => tracked.level != level,
                None => true,
            };
            self.last_fired.insert(
                name.clone(),
                Tracked {
                    level,
                    ticks_absent: 0,
                },
            );
            if changed {
                for cb in self.on_change.lock().unwrap().iter() {
                    cb(name, level);
                }
            }
        }

        // Prune metrics absent for three consecutive ticks.
        let mut to_remove = Vec::new();
        for mut entry in self.last_fired.iter_mut() {
            if !seen.contains_key(entry.key()) {
                entry.ticks_absent += 1;
                if entry.ticks_absent >= 3 {
                    to_remove.push(entry.key().clone());
                }
            }
        }
        for name in to_remove {
            self.last_fired.remove(&name);
        }

        let critical_count = self
            .last_fired
            .iter()
            .filter(|e| e.level == MetricLevel::Critical)
            .count();
        let any_warn = self.last_fired.iter().any(|e| e.level == MetricLevel::Warn);

        match critical_count {
            0 if any_warn => DefenseLevel::Shed,
            0 => DefenseLevel::Normal,
            1 => DefenseLevel::Throttle,
            2 => DefenseLevel::CircuitOpen,
            _ => DefenseLevel::Escalation,
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                this.tick();
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn source(name: &'static str, value: f64) -> Arc<dyn MetricSource> {
        Arc::new(move || -> Result<HashMap<String, f64>, anyhow::Error> {
            Ok(HashMap::from([(name.to_string(), value)]))
        })
    }

    #[test]
    fn escalation_counts_from_spec_8() {
        let mut wd = Watchdog::new(Duration::from_secs(1), default_thresholds());
        wd.add_source(source("worker_inflight_count", 150.0));
        assert_eq!(wd.tick(), DefenseLevel::Throttle);

        let mut wd = Watchdog::new(Duration::from_secs(1), default_thresholds());
        wd.add_source(source("worker_inflight_count", 150.0));
        wd.add_source(source("queue_lag_ms", 9000.0));
        assert_eq!(wd.tick(), DefenseLevel::CircuitOpen);

        let mut wd = Watchdog::new(Duration::from_secs(1), default_thresholds());
        wd.add_source(source("worker_inflight_count", 150.0));
        wd.add_source(source("queue_lag_ms", 9000.0));
        wd.add_source(source("cancel_latency_ms", 6000.0));
        assert_eq!(wd.tick(), DefenseLevel::Escalation);
    }

    #[test]
    fn stable_level_does_not_refire_callback() {
        let mut wd = Watchdog::new(Duration::from_secs(1), default_thresholds());
        wd.add_source(source("worker_inflight_count", 150.0));
        let fires = Arc::new(AtomicUsize::new(0));
        let fires2 = fires.clone();
        wd.on_level_change(Box::new(move |_name, _level| {
            fires2.fetch_add(1, Ordering::SeqCst);
        }));
        wd.tick();
        wd.tick();
        wd.tick();
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn throwing_source_is_skipped_not_fatal() {
        let mut wd = Watchdog::new(Duration::from_secs(1), default_thresholds());
        wd.add_source(Arc::new(|| -> Result<HashMap<String, f64>, anyhow::Error> {
            Err(anyhow::anyhow!("source failed"))
        }));
        wd.add_source(source("worker_inflight_count", 10.0));
        assert_eq!(wd.tick(), DefenseLevel::Normal);
    }
}
