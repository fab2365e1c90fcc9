//! MPI world communicator (feature `mpi`)

use anyhow::Result;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::Communicator;

pub struct MpiCommunicator {
    world: SimpleCommunicator,
    // Finalizes MPI on drop, so it must outlive `world`.
    _universe: Universe,
}

impl MpiCommunicator {
    /// `None` when MPI is unavailable or was already initialised.
    pub fn initialize() -> Option<Self> {
        let universe = mpi::initialize()?;
        let world = universe.world();
        Some(Self {
            world,
            _universe: universe,
        })
    }
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let root_process = self.world.process_at_rank(root as i32);
        let is_root = self.rank() == root;

        let mut len = payload.as_ref().map_or(0u64, |p| p.len() as u64);
        root_process.broadcast_into(&mut len);

        let mut buffer = match payload {
            Some(bytes) if is_root => bytes,
            _ => vec![0u8; len as usize],
        };
        root_process.broadcast_into(&mut buffer[..]);
        Ok(buffer)
    }

    fn backend(&self) -> &'static str {
        "mpi"
    }
}
