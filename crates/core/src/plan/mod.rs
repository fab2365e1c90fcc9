// crates/core/src/plan/mod.rs
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::bootstrap::{CoordinationOptions, DEFAULT_MASTER_PORT};
use crate::catalog::DEFAULT_BASE_UNIVERSE_SIZE;
use crate::config::BenchConfig;
use crate::sampler::ShardPolicy;

pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_NEPOCHS: usize = 3;
pub const DEFAULT_NSAMPLES: usize = 3;

/// Subdirectory of `data_path` holding the training split.
pub const TRAIN_SUBDIR: &str = "train";

/// Fully resolved benchmark parameters.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub data_path: PathBuf,
    pub data_dir: PathBuf,
    pub base_universe_size: u64,
    pub apply_log: bool,
    pub nsamples: usize,
    pub batch_size: usize,
    pub nepochs: usize,
    pub num_workers: usize,
    pub seed: Option<u64>,
    pub shard_policy: ShardPolicy,
    #[serde(skip)]
    pub coordination: CoordinationOptions,
}

impl RunPlan {
    pub fn from_config(cfg: &BenchConfig) -> Result<Self> {
        let data_path = cfg
            .dataset
            .data_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No data path configured (--data_path or dataset.data_path)"))?;
        let r = &cfg.reader;
        let c = &cfg.coordination;

        let defaults = CoordinationOptions::default();
        let coordination = CoordinationOptions {
            backend: c.backend.unwrap_or(defaults.backend),
            group_id: c.group_id.clone().unwrap_or(defaults.group_id),
            master_port: c.master_port.unwrap_or(DEFAULT_MASTER_PORT),
            join_timeout: c
                .join_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.join_timeout),
        };

        let plan = Self {
            data_dir: data_path.join(TRAIN_SUBDIR),
            data_path,
            base_universe_size: cfg.dataset.base_universe_size.unwrap_or(DEFAULT_BASE_UNIVERSE_SIZE),
            apply_log: cfg.dataset.apply_log.unwrap_or(true),
            nsamples: cfg.dataset.nsamples.unwrap_or(DEFAULT_NSAMPLES),
            batch_size: r.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            nepochs: r.nepochs.unwrap_or(DEFAULT_NEPOCHS),
            num_workers: r.read_threads.unwrap_or(1),
            seed: r.seed,
            shard_policy: if r.pad_uneven.unwrap_or(false) {
                ShardPolicy::Pad
            } else {
                ShardPolicy::Truncate
            },
            coordination,
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.nepochs == 0 {
            anyhow::bail!("nepochs must be at least 1");
        }
        if self.base_universe_size == 0 {
            anyhow::bail!("base_universe_size must be at least 1");
        }
        Ok(())
    }

    /// Steps per epoch as announced before the loop: `nsamples / (batch * world)`
    /// rounded half to even.
    pub fn steps_per_epoch(&self, world_size: usize) -> u64 {
        let steps = self.nsamples as f64 / (self.batch_size * world_size.max(1)) as f64;
        steps.round_ties_even() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Backend;

    fn config(path: &str) -> BenchConfig {
        let mut cfg = BenchConfig::default();
        cfg.dataset.data_path = Some(PathBuf::from(path));
        cfg
    }

    #[test]
    fn defaults_match_the_reference_run() {
        let plan = RunPlan::from_config(&config("/data/cosmo")).unwrap();
        assert_eq!(plan.data_dir, PathBuf::from("/data/cosmo/train"));
        assert_eq!(plan.batch_size, 16);
        assert_eq!(plan.nepochs, 3);
        assert_eq!(plan.nsamples, 3);
        assert_eq!(plan.num_workers, 1);
        assert_eq!(plan.base_universe_size, 512);
        assert!(plan.apply_log);
        assert_eq!(plan.shard_policy, ShardPolicy::Truncate);
        assert_eq!(plan.coordination.backend, Backend::Shmem);
        assert_eq!(plan.coordination.master_port, 2345);
    }

    #[test]
    fn missing_data_path_is_an_error() {
        assert!(RunPlan::from_config(&BenchConfig::default()).is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut cfg = config("/data");
        cfg.reader.batch_size = Some(0);
        assert!(RunPlan::from_config(&cfg).is_err());
    }

    #[test]
    fn pad_uneven_selects_pad_policy() {
        let mut cfg = config("/data");
        cfg.reader.pad_uneven = Some(true);
        cfg.coordination.join_timeout_secs = Some(5);
        let plan = cfg.to_run_plan().unwrap();
        assert_eq!(plan.shard_policy, ShardPolicy::Pad);
        assert_eq!(plan.coordination.join_timeout, Duration::from_secs(5));
    }

    #[test]
    fn steps_round_half_to_even() {
        let mut cfg = config("/data");
        cfg.dataset.nsamples = Some(40);
        cfg.reader.batch_size = Some(16);
        let plan = RunPlan::from_config(&cfg).unwrap();
        // 40 / 16 = 2.5 -> 2, 40 / 32 = 1.25 -> 1
        assert_eq!(plan.steps_per_epoch(1), 2);
        assert_eq!(plan.steps_per_epoch(2), 1);

        cfg.dataset.nsamples = Some(3);
        let plan = RunPlan::from_config(&cfg).unwrap();
        assert_eq!(plan.steps_per_epoch(1), 0);
    }
}
