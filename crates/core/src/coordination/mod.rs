//! Cross-rank collectives used by the benchmark.
//!
//! The only collective the loader needs is a root broadcast of an opaque byte
//! payload (rendezvous address, shuffle plan). Backends:
//! - [`ShmemCommunicator`]: node-local group over shared memory segments
//! - `MpiCommunicator` (feature `mpi`): MPI world communicator

#[cfg(feature = "mpi")]
mod mpi_world;
mod shmem;

#[cfg(feature = "mpi")]
pub use mpi_world::MpiCommunicator;
pub use shmem::ShmemCommunicator;

use anyhow::Result;

/// A process group able to run blocking collectives.
///
/// Every rank must issue the same sequence of collective calls.
pub trait Communicator {
    /// Rank of this process within the group
    fn rank(&self) -> usize;

    /// Number of processes in the group
    fn size(&self) -> usize;

    /// Broadcast `payload` from `root` to every rank and return it.
    ///
    /// The root passes `Some(bytes)`, everyone else passes `None`. Blocks
    /// until this rank holds the root's bytes; there is no timeout.
    fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>>;

    /// Short backend name for logs and reports
    fn backend(&self) -> &'static str;
}
