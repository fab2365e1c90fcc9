// src/dataset.rs
//
// Indexed CosmoFlow sample dataset: maps (epoch, position) through the shuffle
// plan to one HDF5 file and reads it with per-rank timing counters.

use anyhow::{Context, Result};
use cosmoflow_formats::{CosmoHdf5Format, Format};
use ndarray::ArrayD;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::catalog::IndexCatalog;
use crate::shuffle::ShufflePlan;
use crate::transform::{to_f32, CosmoFlowTransform, Transform};

/// One loaded sample after conversion and transform.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: ArrayD<f32>,
    pub label: ArrayD<f32>,
}

/// Per-step load accounting.
///
/// Updated with relaxed atomics so loads can run on a worker pool. Reading
/// the totals and resetting them are two separate operations: a load that
/// finishes in between is dropped from the step total.
#[derive(Debug, Default)]
struct LoadCounters {
    load_number: AtomicU64,
    cache_load: AtomicU64,
    load_time_ns: AtomicU64,
    cache_time_ns: AtomicU64,
}

impl LoadCounters {
    fn reset(&self) {
        self.load_number.store(0, Ordering::Relaxed);
        self.cache_load.store(0, Ordering::Relaxed);
        self.load_time_ns.store(0, Ordering::Relaxed);
        self.cache_time_ns.store(0, Ordering::Relaxed);
    }

    fn record_load(&self, elapsed: Duration) {
        self.load_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.load_number.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct CosmoDataset {
    catalog: IndexCatalog,
    plan: Arc<ShufflePlan>,
    format: CosmoHdf5Format,
    num_samples: usize,
    transform: Box<dyn Transform>,
    label_transform: Option<Box<dyn Transform>>,
    epoch: AtomicUsize,
    counters: LoadCounters,
}

impl CosmoDataset {
    pub fn new(catalog: IndexCatalog, plan: Arc<ShufflePlan>, size: usize) -> Self {
        let num_samples = size.min(catalog.sample_count() as usize);
        let format = CosmoHdf5Format::reader(catalog.input_key());
        Self {
            catalog,
            plan,
            format,
            num_samples,
            transform: Box::new(CosmoFlowTransform::default()),
            label_transform: None,
            epoch: AtomicUsize::new(0),
            counters: LoadCounters::default(),
        }
    }

    /// Load the catalog under `data_dir`. A missing index is fatal here.
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        plan: Arc<ShufflePlan>,
        size: usize,
        base_universe_size: u64,
    ) -> Result<Self> {
        let catalog = IndexCatalog::load(data_dir.as_ref(), base_universe_size)?;
        let dataset = Self::new(catalog, plan, size);
        debug!(
            "Dataset over {:?}: {} samples, input key '{}'",
            data_dir.as_ref(),
            dataset.num_samples,
            dataset.format.input_key()
        );
        Ok(dataset)
    }

    pub fn with_transform<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transform = Box::new(transform);
        self
    }

    pub fn with_label_transform<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.label_transform = Some(Box::new(transform));
        self
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    pub fn plan(&self) -> &Arc<ShufflePlan> {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Select the plan row for `epoch` and zero the counters.
    pub fn set_epoch(&self, epoch: usize) -> Result<()> {
        if epoch >= self.plan.nepochs() {
            anyhow::bail!(
                "Epoch {} is outside the shuffle plan ({} epochs)",
                epoch,
                self.plan.nepochs()
            );
        }
        self.epoch.store(epoch, Ordering::Relaxed);
        self.counters.reset();
        Ok(())
    }

    /// Zero the counters, keep the epoch.
    pub fn set_step(&self) {
        self.counters.reset();
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn load_number(&self) -> u64 {
        self.counters.load_number.load(Ordering::Relaxed)
    }

    /// Always zero: samples are never cached.
    pub fn cache_load(&self) -> u64 {
        self.counters.cache_load.load(Ordering::Relaxed)
    }

    /// `(load_time, cache_time)` since the last reset.
    pub fn get_time(&self) -> (Duration, Duration) {
        (
            Duration::from_nanos(self.counters.load_time_ns.load(Ordering::Relaxed)),
            Duration::from_nanos(self.counters.cache_time_ns.load(Ordering::Relaxed)),
        )
    }

    /// Read the sample at `position` of the current epoch.
    pub fn get_item(&self, position: usize) -> Result<Sample> {
        if position >= self.num_samples {
            anyhow::bail!("Position {} out of range for dataset of {}", position, self.num_samples);
        }
        let start = Instant::now();

        let epoch = self.epoch();
        let global_idx = self
            .plan
            .get(epoch, position)
            .ok_or_else(|| anyhow::anyhow!("No plan entry for epoch {} position {}", epoch, position))?;
        let location = self.catalog.locate(global_idx)?;

        let raw = self
            .format
            .read(&location.path)
            .with_context(|| format!("Failed to load sample {} (epoch {})", global_idx, epoch))?;

        let input = self.transform.apply(to_f32(&raw.input));
        let label = match &self.label_transform {
            Some(t) => t.apply(raw.label),
            None => raw.label,
        };

        let elapsed = start.elapsed();
        self.counters.record_load(elapsed);
        trace!("Loaded {:?} in {:?}", location.path, elapsed);

        Ok(Sample { input, label })
    }
}
