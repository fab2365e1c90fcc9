// src/loader.rs
//
// Batch loader over a rank's sampler positions, optionally fanning each batch
// out across a rayon pool.

use anyhow::{Context, Result};
use ndarray::{ArrayD, ArrayViewD, Axis};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::dataset::{CosmoDataset, Sample};
use crate::sampler::DistributedSampler;

/// Samples stacked along a new leading axis.
#[derive(Debug, Clone)]
pub struct Batch {
    pub positions: Vec<usize>,
    pub inputs: ArrayD<f32>,
    pub labels: ArrayD<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

pub struct DataLoader {
    dataset: Arc<CosmoDataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    pool: Option<rayon::ThreadPool>,
}

impl DataLoader {
    /// `num_workers <= 1` loads on the calling thread.
    pub fn new(
        dataset: Arc<CosmoDataset>,
        sampler: DistributedSampler,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be at least 1");
        }
        let pool = if num_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|i| format!("cosmoflow-loader-{}", i))
                .build()
                .context("Failed to build loader thread pool")?;
            debug!("Loader pool with {} workers", num_workers);
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            pool,
        })
    }

    pub fn dataset(&self) -> &Arc<CosmoDataset> {
        &self.dataset
    }

    pub fn sampler(&self) -> &DistributedSampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut DistributedSampler {
        &mut self.sampler
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch, counting a trailing partial batch.
    pub fn num_batches(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            loader: self,
            positions: self.sampler.positions(),
            next: 0,
        }
    }

    fn load_batch(&self, positions: &[usize]) -> Result<Batch> {
        let samples: Vec<Sample> = match &self.pool {
            Some(pool) => pool.install(|| {
                positions
                    .par_iter()
                    .map(|&p| self.dataset.get_item(p))
                    .collect::<Result<Vec<_>>>()
            })?,
            None => positions
                .iter()
                .map(|&p| self.dataset.get_item(p))
                .collect::<Result<Vec<_>>>()?,
        };
        collate(positions.to_vec(), &samples)
    }
}

/// Iterator over one epoch's batches.
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    positions: Vec<usize>,
    next: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.positions.len() {
            return None;
        }
        let end = (self.next + self.loader.batch_size).min(self.positions.len());
        let chunk = &self.positions[self.next..end];
        self.next = end;
        Some(self.loader.load_batch(chunk))
    }
}

fn collate(positions: Vec<usize>, samples: &[Sample]) -> Result<Batch> {
    let inputs: Vec<ArrayViewD<f32>> = samples.iter().map(|s| s.input.view()).collect();
    let labels: Vec<ArrayViewD<f32>> = samples.iter().map(|s| s.label.view()).collect();
    let inputs = ndarray::stack(Axis(0), &inputs[..]).context("Samples in a batch differ in input shape")?;
    let labels = ndarray::stack(Axis(0), &labels[..]).context("Samples in a batch differ in label shape")?;
    Ok(Batch {
        positions,
        inputs,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn sample(shape: &[usize], value: f32) -> Sample {
        Sample {
            input: ArrayD::from_elem(IxDyn(shape), value),
            label: ArrayD::from_elem(IxDyn(&[4]), value),
        }
    }

    #[test]
    fn collate_adds_leading_axis() {
        let batch = collate(vec![3, 1], &[sample(&[2, 2, 2], 1.0), sample(&[2, 2, 2], 2.0)]).unwrap();
        assert_eq!(batch.inputs.shape(), &[2, 2, 2, 2]);
        assert_eq!(batch.labels.shape(), &[2, 4]);
        assert_eq!(batch.len(), 2);
        assert!(batch.inputs.index_axis(Axis(0), 1).iter().all(|&v| v == 2.0));
    }

    #[test]
    fn collate_rejects_mismatched_shapes() {
        let err = collate(vec![0, 1], &[sample(&[2, 2], 1.0), sample(&[3, 2], 1.0)]).unwrap_err();
        assert!(err.to_string().contains("input shape"));
    }
}
