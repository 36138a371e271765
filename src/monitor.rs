//! Monitoring boundary consumed by the engine and transaction manager.
//!
//! Resource sampling and threshold alerting live in an external collaborator;
//! the core only reports into this interface and never owns sampling logic.
//! `LogMonitor` is the default sink: it aggregates counters in memory and
//! forwards updates to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// One per-chunk metrics update reported by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsUpdate {
    pub processed: usize,
    pub failed: usize,
    pub validation_errors: usize,
    pub processing_errors: usize,
    pub elapsed_secs: f64,
    pub memory_mb: f64,
}

/// Accumulated processing metrics for one named run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub name: String,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub validation_errors: usize,
    pub processing_errors: usize,
    pub total_time_secs: f64,
    pub peak_memory_mb: f64,
}

/// Point-in-time resource sample from the external monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Metric sink the core reports into.
pub trait Monitor: Send + Sync {
    fn start_processing_metrics(&self, name: &str, total: usize);

    fn update_processing_metrics(&self, name: &str, update: &MetricsUpdate);

    fn get_processing_metrics(&self, name: &str) -> Option<ProcessingMetrics>;

    /// Latest resource sample, if the external sampler is active.
    fn latest_resource_metrics(&self) -> Option<ResourceMetrics>;
}

/// Monitor that discards everything. Useful in tests.
#[derive(Debug, Default)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn start_processing_metrics(&self, _name: &str, _total: usize) {}

    fn update_processing_metrics(&self, _name: &str, _update: &MetricsUpdate) {}

    fn get_processing_metrics(&self, _name: &str) -> Option<ProcessingMetrics> {
        None
    }

    fn latest_resource_metrics(&self) -> Option<ResourceMetrics> {
        None
    }
}

/// In-process monitor that aggregates counters and logs updates.
///
/// This is not the resource sampler; it only keeps the processing-side
/// counters the engine reports.
#[derive(Debug, Default)]
pub struct LogMonitor {
    runs: Mutex<HashMap<String, ProcessingMetrics>>,
}

impl LogMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Monitor for LogMonitor {
    fn start_processing_metrics(&self, name: &str, total: usize) {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runs.insert(
            name.to_string(),
            ProcessingMetrics {
                name: name.to_string(),
                total,
                ..Default::default()
            },
        );
        debug!(run = name, total, "Processing metrics started");
    }

    fn update_processing_metrics(&self, name: &str, update: &MetricsUpdate) {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Transaction reporters have no up-front total, so updates may
        // arrive before any explicit start; create the entry on demand.
        let metrics = runs.entry(name.to_string()).or_insert_with(|| ProcessingMetrics {
            name: name.to_string(),
            ..Default::default()
        });
        metrics.processed += update.processed;
        metrics.failed += update.failed;
        metrics.validation_errors += update.validation_errors;
        metrics.processing_errors += update.processing_errors;
        metrics.total_time_secs += update.elapsed_secs;
        if update.memory_mb > metrics.peak_memory_mb {
            metrics.peak_memory_mb = update.memory_mb;
        }
        debug!(
            run = name,
            processed = update.processed,
            failed = update.failed,
            elapsed_secs = update.elapsed_secs,
            memory_mb = update.memory_mb,
            "Processing metrics updated"
        );
    }

    fn get_processing_metrics(&self, name: &str) -> Option<ProcessingMetrics> {
        let runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runs.get(name).cloned()
    }

    fn latest_resource_metrics(&self) -> Option<ResourceMetrics> {
        // Resource sampling belongs to the external monitor process.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_monitor_accumulates_updates() {
        let monitor = LogMonitor::new();
        monitor.start_processing_metrics("run", 10);
        monitor.update_processing_metrics(
            "run",
            &MetricsUpdate {
                processed: 100,
                elapsed_secs: 0.5,
                memory_mb: 12.0,
                ..Default::default()
            },
        );
        monitor.update_processing_metrics(
            "run",
            &MetricsUpdate {
                failed: 1,
                processing_errors: 1,
                memory_mb: 4.0,
                ..Default::default()
            },
        );

        let metrics = monitor.get_processing_metrics("run").unwrap();
        assert_eq!(metrics.total, 10);
        assert_eq!(metrics.processed, 100);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.processing_errors, 1);
        assert!((metrics.peak_memory_mb - 12.0).abs() < 1e-9);
    }

    #[test]
    fn update_without_start_creates_the_run() {
        // Transaction outcomes arrive without a start/total.
        let monitor = LogMonitor::new();
        monitor.update_processing_metrics(
            "parcels",
            &MetricsUpdate {
                processed: 1,
                elapsed_secs: 0.1,
                ..Default::default()
            },
        );

        let metrics = monitor.get_processing_metrics("parcels").unwrap();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.processed, 1);
    }

    #[test]
    fn unknown_run_has_no_metrics() {
        let monitor = LogMonitor::new();
        assert!(monitor.get_processing_metrics("missing").is_none());
    }
}
