use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

/// Timings for one pass over a rank's shard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Sum of per-step dataset load and cache time.
    pub io_time: Duration,
    pub wall_time: Duration,
    pub batches: u64,
    pub samples: u64,
}

/// Performance metrics collection
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub total_time: Option<Duration>,
    pub epochs: Vec<EpochMetrics>,
    /// Per-batch `load_number()` taken during the snapshot epoch.
    pub snapshot_loads: Vec<u64>,
    /// Per-batch `cache_load()` taken during the snapshot epoch.
    pub snapshot_cache_loads: Vec<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_total_time(&mut self, duration: Duration) {
        self.total_time = Some(duration);
    }

    pub fn record_epoch(&mut self, epoch: EpochMetrics) {
        self.epochs.push(epoch);
    }

    pub fn record_snapshot(&mut self, loads: u64, cache_loads: u64) {
        self.snapshot_loads.push(loads);
        self.snapshot_cache_loads.push(cache_loads);
    }

    pub fn io_per_epoch(&self) -> Vec<Duration> {
        self.epochs.iter().map(|e| e.io_time).collect()
    }

    pub fn total_io_time(&self) -> Duration {
        self.epochs.iter().map(|e| e.io_time).sum()
    }

    pub fn total_samples(&self) -> u64 {
        self.epochs.iter().map(|e| e.samples).sum()
    }

    pub fn total_batches(&self) -> u64 {
        self.epochs.iter().map(|e| e.batches).sum()
    }

    /// Samples per second of accumulated I/O time.
    pub fn io_throughput(&self) -> Option<f64> {
        let seconds = self.total_io_time().as_secs_f64();
        if seconds > 0.0 {
            Some(self.total_samples() as f64 / seconds)
        } else {
            None
        }
    }
}

/// Serializable end-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub started_at: DateTime<Utc>,
    pub processes: usize,
    pub backend: String,
    pub nepochs: usize,
    pub batch_size: usize,
    pub nsamples: usize,
    pub total_loading_time_s: f64,
    pub io_time_s: f64,
    pub io_time_per_epoch_s: Vec<f64>,
    pub wall_time_per_epoch_s: Vec<f64>,
    pub samples_loaded: u64,
    pub batches: u64,
    pub samples_per_io_second: Option<f64>,
    pub snapshot_loads: Vec<u64>,
    pub snapshot_cache_loads: Vec<u64>,
}

impl BenchmarkReport {
    pub fn new(
        metrics: &Metrics,
        started_at: DateTime<Utc>,
        processes: usize,
        backend: &str,
        nepochs: usize,
        batch_size: usize,
        nsamples: usize,
    ) -> Self {
        Self {
            started_at,
            processes,
            backend: backend.to_string(),
            nepochs,
            batch_size,
            nsamples,
            total_loading_time_s: metrics.total_time.unwrap_or_default().as_secs_f64(),
            io_time_s: metrics.total_io_time().as_secs_f64(),
            io_time_per_epoch_s: metrics.io_per_epoch().iter().map(Duration::as_secs_f64).collect(),
            wall_time_per_epoch_s: metrics.epochs.iter().map(|e| e.wall_time.as_secs_f64()).collect(),
            samples_loaded: metrics.total_samples(),
            batches: metrics.total_batches(),
            samples_per_io_second: metrics.io_throughput(),
            snapshot_loads: metrics.snapshot_loads.clone(),
            snapshot_cache_loads: metrics.snapshot_cache_loads.clone(),
        }
    }

    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            "*******************************************".to_string(),
            format!("Total loading time: {:.6}", self.total_loading_time_s),
            format!("Number of Processes used: {}", self.processes),
            format!("Number of Epochs: {}", self.nepochs),
            format!("Batch Size: {}", self.batch_size),
            format!("DataLoading time baseline: {:.6}", self.io_time_s),
            format!(
                "DataLoading time baseline each epoch: [{}]",
                self.io_time_per_epoch_s
                    .iter()
                    .map(|t| format!("{:.6}", t))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            "*******************************************".to_string(),
        ]
    }

    pub fn print_summary(&self) {
        for line in self.summary_lines() {
            println!("{}", line);
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize benchmark report")
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)
            .with_context(|| format!("Failed to write report to {:?}", path.as_ref()))
    }
}
