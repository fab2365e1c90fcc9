// src/sampler.rs
//
// Striped partition of dataset positions across ranks. Positions are not
// reshuffled here; randomness comes from the shuffle plan alone.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::shuffle::ShufflePlan;

/// What to do with the `len % world_size` positions left over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardPolicy {
    /// Drop the tail so every rank gets `len / world_size` disjoint positions.
    #[default]
    Truncate,
    /// Wrap around to the start so every rank gets `ceil(len / world_size)`.
    /// Some positions are then read by two ranks.
    Pad,
}

#[derive(Debug, Clone)]
pub struct DistributedSampler {
    plan: Arc<ShufflePlan>,
    dataset_len: usize,
    rank: usize,
    world_size: usize,
    policy: ShardPolicy,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(
        plan: Arc<ShufflePlan>,
        dataset_len: usize,
        rank: usize,
        world_size: usize,
        policy: ShardPolicy,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            anyhow::bail!("Invalid rank {} for world size {}", rank, world_size);
        }
        if dataset_len > plan.nsamples() {
            anyhow::bail!(
                "Dataset of {} samples is longer than the shuffle plan rows ({})",
                dataset_len,
                plan.nsamples()
            );
        }
        Ok(Self {
            plan,
            dataset_len,
            rank,
            world_size,
            policy,
            epoch: 0,
        })
    }

    pub fn set_epoch(&mut self, epoch: usize) -> Result<()> {
        if epoch >= self.plan.nepochs() {
            anyhow::bail!(
                "Epoch {} is outside the shuffle plan ({} epochs)",
                epoch,
                self.plan.nepochs()
            );
        }
        self.epoch = epoch;
        Ok(())
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Positions this rank reads per epoch.
    pub fn num_samples(&self) -> usize {
        match self.policy {
            ShardPolicy::Truncate => self.dataset_len / self.world_size,
            ShardPolicy::Pad => self.dataset_len.div_ceil(self.world_size),
        }
    }

    /// Dataset positions assigned to this rank, in order.
    pub fn positions(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }
        let total = self.num_samples() * self.world_size;
        (self.rank..total)
            .step_by(self.world_size)
            .map(|i| i % self.dataset_len)
            .collect()
    }

    /// Global sample indices this rank reads in the current epoch.
    pub fn global_indices(&self) -> Vec<u64> {
        let row = self.plan.epoch(self.epoch).unwrap_or_default();
        self.positions().into_iter().map(|p| row[p]).collect()
    }
}
