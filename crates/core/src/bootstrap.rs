//! Distributed bootstrap: probe a coordination backend, agree on a rendezvous
//! address and publish the variables downstream distributed initialisation reads.
//!
//! Failing to coordinate is not an error. The process continues alone as rank 0
//! of a world of one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(feature = "mpi")]
use crate::coordination::MpiCommunicator;
use crate::coordination::{Communicator, ShmemCommunicator};
use crate::topology::Topology;

/// Fixed rendezvous port published as `MASTER_PORT`.
pub const DEFAULT_MASTER_PORT: u16 = 2345;

/// Group id used when neither the config nor the launcher names one.
pub const DEFAULT_GROUP_ID: &str = "cosmoflow";

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Which coordination backend to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Shmem,
    Mpi,
    None,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shmem" | "shm" => Ok(Backend::Shmem),
            "mpi" => Ok(Backend::Mpi),
            "none" | "off" => Ok(Backend::None),
            other => anyhow::bail!("Unsupported coordination backend: {}", other),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Shmem => "shmem",
            Backend::Mpi => "mpi",
            Backend::None => "none",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinationOptions {
    pub backend: Backend,
    /// Shared by every rank of one job; names the shared memory segments.
    pub group_id: String,
    pub master_port: u16,
    /// Bound on joining the group. Broadcasts themselves never time out.
    pub join_timeout: Duration,
}

/// Launcher variables naming the current job, tried in order.
const JOB_ID_SOURCES: &[&str] = &[
    "SLURM_JOB_ID",
    "PMIX_NAMESPACE",
    "OMPI_MCA_ess_base_jobid",
    "MPIRUN_ID",
];

impl CoordinationOptions {
    /// A launcher job id keeps concurrent jobs on one node apart.
    pub fn default_group_id() -> String {
        Self::group_id_from(|name| std::env::var(name).ok())
    }

    /// [`Self::default_group_id`] over an arbitrary variable lookup.
    pub fn group_id_from<F>(lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        JOB_ID_SOURCES
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
            .map(|job| format!("{}_{}", DEFAULT_GROUP_ID, sanitize_segment_name(job.trim())))
            .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string())
    }
}

/// Shared memory names only take a restricted character set.
fn sanitize_segment_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

impl Default for CoordinationOptions {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            group_id: Self::default_group_id(),
            master_port: DEFAULT_MASTER_PORT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Outcome of probing a coordination backend.
pub enum Capability {
    Available {
        communicator: Box<dyn Communicator>,
        topology: Topology,
    },
    Unavailable {
        reason: String,
    },
}

/// Try to bring up the configured backend for `topology`.
pub fn probe(topology: &Topology, options: &CoordinationOptions) -> Capability {
    match options.backend {
        Backend::None => Capability::Unavailable {
            reason: "coordination disabled".to_string(),
        },
        Backend::Shmem => {
            if options.group_id == DEFAULT_GROUP_ID && topology.world_size > 1 {
                warn!(
                    "No launcher job id found; concurrent jobs on this node share group '{}'. Pass --group-id to keep them apart",
                    DEFAULT_GROUP_ID
                );
            }
            probe_shmem(topology, options)
        }
        Backend::Mpi => probe_mpi(topology),
    }
}

fn probe_shmem(topology: &Topology, options: &CoordinationOptions) -> Capability {
    match ShmemCommunicator::join(
        topology.world_rank,
        topology.world_size,
        &options.group_id,
        options.join_timeout,
    ) {
        Ok(comm) => Capability::Available {
            communicator: Box::new(comm),
            topology: *topology,
        },
        Err(e) => Capability::Unavailable {
            reason: format!("{:#}", e),
        },
    }
}

#[cfg(feature = "mpi")]
fn probe_mpi(topology: &Topology) -> Capability {
    let Some(comm) = MpiCommunicator::initialize() else {
        return Capability::Unavailable {
            reason: "MPI initialization failed".to_string(),
        };
    };

    let mut topology = *topology;
    if comm.rank() != topology.world_rank || comm.size() != topology.world_size {
        warn!(
            "Launcher reports rank {}/{} but MPI reports {}/{}; using MPI",
            topology.world_rank,
            topology.world_size,
            comm.rank(),
            comm.size()
        );
        topology.world_rank = comm.rank();
        topology.world_size = comm.size();
    }
    Capability::Available {
        communicator: Box::new(comm),
        topology,
    }
}

#[cfg(not(feature = "mpi"))]
fn probe_mpi(_topology: &Topology) -> Capability {
    Capability::Unavailable {
        reason: "built without the `mpi` feature".to_string(),
    }
}

/// Address every rank uses to reach the coordination root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rendezvous {
    pub master_addr: String,
    pub master_port: u16,
}

/// The process group this rank runs in, possibly degraded to a single process.
pub struct DistributedContext {
    topology: Topology,
    communicator: Option<Box<dyn Communicator>>,
    rendezvous: Option<Rendezvous>,
}

impl DistributedContext {
    /// Degraded mode: no collectives, rank 0 of 1.
    pub fn single_process() -> Self {
        Self {
            topology: Topology::single_process(),
            communicator: None,
            rendezvous: None,
        }
    }

    /// Probe the backend and, when it comes up, agree on the rendezvous
    /// address and publish it to the process environment.
    pub fn establish(topology: Topology, options: &CoordinationOptions) -> Result<Self> {
        match probe(&topology, options) {
            Capability::Available {
                communicator,
                topology,
            } => Ok(Self::from_communicator(communicator, topology, options)),
            Capability::Unavailable { reason } => Ok(Self::degrade(&reason)),
        }
    }

    /// Agree on the rendezvous address over an already joined group.
    ///
    /// A failed broadcast degrades to a single process like a failed probe.
    pub fn from_communicator(
        communicator: Box<dyn Communicator>,
        topology: Topology,
        options: &CoordinationOptions,
    ) -> Self {
        let mut ctx = Self {
            topology,
            communicator: Some(communicator),
            rendezvous: None,
        };

        let master_addr = match ctx.agree_master_addr() {
            Ok(addr) => addr,
            Err(e) => return Self::degrade(&format!("{:#}", e)),
        };
        ctx.rendezvous = Some(Rendezvous {
            master_addr,
            master_port: options.master_port,
        });
        ctx.publish_environment();

        if topology.local_rank == 0 {
            println!("This is GPU 0 from node: {}", local_hostname());
        }
        ctx
    }

    fn degrade(reason: &str) -> Self {
        warn!("Distributed initialization failed, continuing as a single process: {}", reason);
        Self::single_process()
    }

    fn agree_master_addr(&self) -> Result<String> {
        let addr = self
            .broadcast_from_root(|| Ok(local_hostname().into_bytes()))
            .context("Rendezvous address broadcast failed")?;
        String::from_utf8(addr).context("Rendezvous address is not UTF-8")
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn with_coordination(&self) -> bool {
        self.communicator.is_some()
    }

    pub fn rendezvous(&self) -> Option<&Rendezvous> {
        self.rendezvous.as_ref()
    }

    pub fn backend(&self) -> &'static str {
        self.communicator.as_ref().map_or("none", |c| c.backend())
    }

    /// Run `produce` on rank 0 and hand its bytes to every rank.
    ///
    /// Without coordination the local result is returned as is.
    pub fn broadcast_from_root<F>(&self, produce: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        match &self.communicator {
            None => produce(),
            Some(comm) => {
                let payload = if comm.rank() == 0 { Some(produce()?) } else { None };
                comm.broadcast(0, payload)
            }
        }
    }

    /// Variables consumed by downstream distributed initialisation.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if self.communicator.is_none() {
            return vars;
        }
        vars.push(("RANK", self.topology.world_rank.to_string()));
        vars.push(("WORLD_SIZE", self.topology.world_size.to_string()));
        if let Some(rendezvous) = &self.rendezvous {
            vars.push(("MASTER_ADDR", rendezvous.master_addr.clone()));
            vars.push(("MASTER_PORT", rendezvous.master_port.to_string()));
        }
        vars
    }

    fn publish_environment(&self) {
        for (name, value) in self.environment() {
            debug!("Publishing {}={}", name, value);
            std::env::set_var(name, value);
        }
    }
}

/// Host name of this node, or loopback when it cannot be resolved.
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().to_string(),
        Err(e) => {
            warn!("Could not resolve host name, using 127.0.0.1: {}", e);
            "127.0.0.1".to_string()
        }
    }
}
