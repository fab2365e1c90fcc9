// src/shuffle.rs
//
// Per-epoch shuffle plan: rank 0 draws one permutation per epoch and every
// rank receives the same table before any sample is read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::bootstrap::DistributedContext;

/// Magic number for the encoded plan
const PLAN_MAGIC: &[u8; 4] = b"SHPL";

/// magic + epochs (u32) + samples (u64)
const PLAN_HEADER_LEN: usize = 4 + 4 + 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Shuffle list loading not yet supported (requested {0:?})")]
    Unsupported(PathBuf),

    #[error("Malformed shuffle plan: {0}")]
    Malformed(String),
}

/// `nepochs` rows, each a permutation of `0..nsamples`, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShufflePlan {
    nepochs: usize,
    nsamples: usize,
    indices: Vec<u64>,
}

impl ShufflePlan {
    /// Draw a fresh plan. Without a seed the generator is seeded by the OS.
    pub fn generate(nepochs: usize, nsamples: usize, seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::generate_with(nepochs, nsamples, &mut ChaCha8Rng::seed_from_u64(seed)),
            None => Self::generate_with(nepochs, nsamples, &mut rand::rng()),
        }
    }

    pub fn generate_with<R: Rng + ?Sized>(nepochs: usize, nsamples: usize, rng: &mut R) -> Self {
        let mut indices = Vec::with_capacity(nepochs * nsamples);
        for _ in 0..nepochs {
            let mut row: Vec<u64> = (0..nsamples as u64).collect();
            row.shuffle(rng);
            indices.extend_from_slice(&row);
        }
        Self {
            nepochs,
            nsamples,
            indices,
        }
    }

    /// Reloading a plan saved by an earlier run is not supported.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        Err(PlanError::Unsupported(path.to_path_buf()))
    }

    /// Rank 0 draws the plan, every rank returns the same copy.
    pub fn broadcast(
        ctx: &DistributedContext,
        nepochs: usize,
        nsamples: usize,
        seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        let bytes = ctx.broadcast_from_root(|| Ok(Self::generate(nepochs, nsamples, seed).encode().to_vec()))?;
        let plan = Self::decode(&bytes)?;
        if plan.nepochs != nepochs || plan.nsamples != nsamples {
            anyhow::bail!(
                "Root broadcast a {}x{} shuffle plan but this rank expected {}x{}",
                plan.nepochs,
                plan.nsamples,
                nepochs,
                nsamples
            );
        }
        info!(
            "🔀 Rank {}: Shuffle plan agreed ({} epochs x {} samples)",
            ctx.topology().world_rank,
            nepochs,
            nsamples
        );
        Ok(plan)
    }

    pub fn nepochs(&self) -> usize {
        self.nepochs
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// The permutation for `epoch`.
    pub fn epoch(&self, epoch: usize) -> Option<&[u64]> {
        if epoch >= self.nepochs {
            return None;
        }
        let start = epoch * self.nsamples;
        Some(&self.indices[start..start + self.nsamples])
    }

    /// Global sample index at `position` of `epoch`.
    pub fn get(&self, epoch: usize, position: usize) -> Option<u64> {
        self.epoch(epoch)?.get(position).copied()
    }

    /// Little-endian: magic, `u32` epochs, `u64` samples, `u64` entries.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PLAN_HEADER_LEN + self.indices.len() * 8);
        buf.put_slice(PLAN_MAGIC);
        buf.put_u32_le(self.nepochs as u32);
        buf.put_u64_le(self.nsamples as u64);
        for &idx in &self.indices {
            buf.put_u64_le(idx);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PlanError> {
        if data.len() < PLAN_HEADER_LEN {
            return Err(PlanError::Malformed(format!("{} bytes is shorter than the header", data.len())));
        }
        if &data[0..4] != PLAN_MAGIC {
            return Err(PlanError::Malformed("bad magic number".to_string()));
        }

        let mut buf = &data[4..];
        let nepochs = buf.get_u32_le() as usize;
        let nsamples = buf.get_u64_le() as usize;

        let expected = nepochs
            .checked_mul(nsamples)
            .and_then(|n| n.checked_mul(8))
            .ok_or_else(|| PlanError::Malformed(format!("{} x {} entries overflow", nepochs, nsamples)))?;
        if buf.remaining() != expected {
            return Err(PlanError::Malformed(format!(
                "expected {} bytes of entries, got {}",
                expected,
                buf.remaining()
            )));
        }

        let mut indices = Vec::with_capacity(nepochs * nsamples);
        while buf.has_remaining() {
            indices.push(buf.get_u64_le());
        }

        let plan = Self {
            nepochs,
            nsamples,
            indices,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Every row must be a permutation of `0..nsamples`.
    fn validate(&self) -> Result<(), PlanError> {
        let mut seen = vec![false; self.nsamples];
        for epoch in 0..self.nepochs {
            seen.iter_mut().for_each(|s| *s = false);
            let row = self.epoch(epoch).unwrap_or_default();
            for &idx in row {
                let slot = seen
                    .get_mut(idx as usize)
                    .ok_or_else(|| PlanError::Malformed(format!("epoch {} holds index {} out of range", epoch, idx)))?;
                if *slot {
                    return Err(PlanError::Malformed(format!("epoch {} repeats index {}", epoch, idx)));
                }
                *slot = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{Backend, CoordinationOptions, DEFAULT_MASTER_PORT};
    use crate::topology::Topology;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn assert_permutation(row: &[u64], n: usize) {
        let set: HashSet<u64> = row.iter().copied().collect();
        assert_eq!(row.len(), n);
        assert_eq!(set.len(), n, "row has duplicates: {:?}", row);
        assert!(row.iter().all(|&i| (i as usize) < n));
    }

    #[test]
    fn plan_has_one_permutation_per_epoch() {
        for (nepochs, nsamples) in [(1, 1), (3, 10), (6, 257)] {
            let plan = ShufflePlan::generate(nepochs, nsamples, None);
            assert_eq!(plan.nepochs(), nepochs);
            assert_eq!(plan.nsamples(), nsamples);
            for epoch in 0..nepochs {
                assert_permutation(plan.epoch(epoch).unwrap(), nsamples);
            }
            assert!(plan.epoch(nepochs).is_none());
        }
    }

    #[test]
    fn seeded_plans_are_reproducible() {
        let a = ShufflePlan::generate(4, 100, Some(42));
        let b = ShufflePlan::generate(4, 100, Some(42));
        assert_eq!(a, b);
        assert_ne!(a.epoch(0), a.epoch(1));
    }

    #[test]
    fn codec_preserves_plan() {
        let plan = ShufflePlan::generate(3, 17, Some(1));
        let decoded = ShufflePlan::decode(&plan.encode()).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn decode_rejects_duplicate_entries() {
        let plan = ShufflePlan {
            nepochs: 1,
            nsamples: 3,
            indices: vec![0, 1, 1],
        };
        let err = ShufflePlan::decode(&plan.encode()).unwrap_err();
        assert_eq!(err, PlanError::Malformed("epoch 0 repeats index 1".to_string()));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let bytes = ShufflePlan::generate(2, 4, Some(3)).encode();
        assert!(ShufflePlan::decode(&bytes[..bytes.len() - 8]).is_err());
        assert!(ShufflePlan::decode(b"SHP").is_err());
    }

    #[test]
    fn reload_fails_loudly() {
        let err = ShufflePlan::load(Path::new("/tmp/shuffle.npy")).unwrap_err();
        assert!(matches!(err, PlanError::Unsupported(_)));
    }

    #[test]
    fn broadcast_gives_every_rank_the_same_plan() {
        let world = 3;
        let group = format!("plan_{}", std::process::id());
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let group = group.clone();
                thread::spawn(move || {
                    if rank != 0 {
                        thread::sleep(Duration::from_millis(50));
                    }
                    let topo = Topology {
                        local_rank: rank,
                        local_size: world,
                        world_rank: rank,
                        world_size: world,
                    };
                    let options = CoordinationOptions {
                        backend: Backend::Shmem,
                        group_id: group,
                        master_port: DEFAULT_MASTER_PORT,
                        join_timeout: Duration::from_secs(10),
                    };
                    let ctx = DistributedContext::establish(topo, &options).unwrap();
                    assert!(ctx.with_coordination());
                    let rendezvous = ctx.rendezvous().cloned().unwrap();
                    (rendezvous, ShufflePlan::broadcast(&ctx, 4, 50, None).unwrap())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (root_rendezvous, root_plan) = &results[0];
        for (rendezvous, plan) in &results[1..] {
            assert_eq!(rendezvous, root_rendezvous);
            assert_eq!(plan.encode(), root_plan.encode());
        }
    }
}
