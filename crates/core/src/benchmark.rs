// src/benchmark.rs
//
// The I/O timing loop: per epoch, iterate every batch of this rank's shard and
// accumulate the dataset's load and cache time step by step.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::bootstrap::DistributedContext;
use crate::dataset::CosmoDataset;
use crate::loader::DataLoader;
use crate::metrics::{BenchmarkReport, EpochMetrics, Metrics};
use crate::plan::RunPlan;
use crate::sampler::DistributedSampler;
use crate::shuffle::ShufflePlan;
use crate::transform::CosmoFlowTransform;

/// Epoch whose per-batch load counts are recorded.
pub const SNAPSHOT_EPOCH: usize = 5;

/// Main benchmark execution engine
#[derive(Debug, Clone)]
pub struct BenchmarkRunner {
    plan: RunPlan,
}

impl BenchmarkRunner {
    pub fn new(plan: RunPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Root prints the sample and step counts before anything is read.
    pub fn announce(&self, ctx: &DistributedContext) {
        let topology = ctx.topology();
        if topology.is_root() {
            println!("number of training:{}", self.plan.nsamples);
            println!("Will have {} steps.", self.plan.steps_per_epoch(topology.world_size));
        }
    }

    /// Agree on the shuffle plan with every rank.
    pub fn shuffle_plan(&self, ctx: &DistributedContext) -> Result<Arc<ShufflePlan>> {
        let plan = ShufflePlan::broadcast(ctx, self.plan.nepochs, self.plan.nsamples, self.plan.seed)?;
        Ok(Arc::new(plan))
    }

    /// Open the dataset and wire up this rank's sampler and loader.
    pub fn build_loader(&self, ctx: &DistributedContext, shuffle: Arc<ShufflePlan>) -> Result<DataLoader> {
        let topology = ctx.topology();
        let dataset = CosmoDataset::open(
            &self.plan.data_dir,
            Arc::clone(&shuffle),
            self.plan.nsamples,
            self.plan.base_universe_size,
        )?
        .with_transform(CosmoFlowTransform::new(self.plan.apply_log));

        let sampler = DistributedSampler::new(
            shuffle,
            dataset.len(),
            topology.world_rank,
            topology.world_size,
            self.plan.shard_policy,
        )?;
        info!(
            "Rank {}: {} of {} samples per epoch in batches of {}",
            topology.world_rank,
            sampler.num_samples(),
            dataset.len(),
            self.plan.batch_size
        );

        DataLoader::new(Arc::new(dataset), sampler, self.plan.batch_size, self.plan.num_workers)
    }

    /// Run every epoch. Blocking; call from a blocking task.
    pub fn run_epochs(&self, loader: &mut DataLoader) -> Result<Metrics> {
        let dataset = Arc::clone(loader.dataset());
        let mut metrics = Metrics::new();
        let load_start = Instant::now();

        for epoch in 0..self.plan.nepochs {
            let epoch_start = Instant::now();
            loader.sampler_mut().set_epoch(epoch)?;
            dataset.set_epoch(epoch)?;

            let mut io_time = Duration::ZERO;
            let mut batches = 0u64;
            let mut samples = 0u64;
            for batch in loader.iter() {
                let batch = batch?;
                if epoch == SNAPSHOT_EPOCH {
                    metrics.record_snapshot(dataset.load_number(), dataset.cache_load());
                }
                let (load_time, cache_time) = dataset.get_time();
                io_time += load_time + cache_time;
                dataset.set_step();

                batches += 1;
                samples += batch.len() as u64;
            }

            let wall_time = epoch_start.elapsed();
            debug!(
                "Epoch {}: {} batches, {} samples, io {:?}, wall {:?}",
                epoch, batches, samples, io_time, wall_time
            );
            metrics.record_epoch(EpochMetrics {
                epoch,
                io_time,
                wall_time,
                batches,
                samples,
            });
        }

        metrics.record_total_time(load_start.elapsed());
        Ok(metrics)
    }

    pub fn report(&self, metrics: &Metrics, ctx: &DistributedContext, started_at: DateTime<Utc>) -> BenchmarkReport {
        BenchmarkReport::new(
            metrics,
            started_at,
            ctx.topology().world_size,
            ctx.backend(),
            self.plan.nepochs,
            self.plan.batch_size,
            self.plan.nsamples,
        )
    }

    /// Everything after bootstrap on the calling thread.
    pub fn run(&self, ctx: &DistributedContext) -> Result<BenchmarkReport> {
        let started_at = Utc::now();
        self.announce(ctx);
        let shuffle = self.shuffle_plan(ctx)?;
        let mut loader = self.build_loader(ctx, shuffle)?;
        let metrics = self.run_epochs(&mut loader)?;
        Ok(self.report(&metrics, ctx, started_at))
    }
}
