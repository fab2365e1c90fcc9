// src/topology.rs
//
// Rank/size discovery from the environment variables set by common HPC launchers.

use std::fmt;
use thiserror::Error;

/// Parses the raw value of one environment variable.
type Parser = fn(&str) -> Option<usize>;

/// Error type for topology resolution
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Could not get {0}")]
    Unresolved(TopologyField),

    #[error("Invalid value {value:?} for {var} ({field})")]
    Invalid {
        field: TopologyField,
        var: &'static str,
        value: String,
    },

    #[error("Inconsistent topology: {0}")]
    Inconsistent(String),
}

/// The four values a launcher tells each process about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyField {
    LocalRank,
    LocalSize,
    WorldRank,
    WorldSize,
}

const LOCAL_RANK_SOURCES: &[(&str, Parser)] = &[
    ("MV2_COMM_WORLD_LOCAL_RANK", parse_plain),
    ("OMPI_COMM_WORLD_LOCAL_RANK", parse_plain),
    ("SLURM_LOCALID", parse_plain),
];

const LOCAL_SIZE_SOURCES: &[(&str, Parser)] = &[
    ("MV2_COMM_WORLD_LOCAL_SIZE", parse_plain),
    ("OMPI_COMM_WORLD_LOCAL_SIZE", parse_plain),
    ("SLURM_NTASKS_PER_NODE", parse_slurm_tasks),
];

const WORLD_RANK_SOURCES: &[(&str, Parser)] = &[
    ("MV2_COMM_WORLD_RANK", parse_plain),
    ("OMPI_COMM_WORLD_RANK", parse_plain),
    ("SLURM_PROCID", parse_plain),
];

const WORLD_SIZE_SOURCES: &[(&str, Parser)] = &[
    ("MV2_COMM_WORLD_SIZE", parse_plain),
    ("OMPI_COMM_WORLD_SIZE", parse_plain),
    ("SLURM_NTASKS", parse_slurm_tasks),
];

impl TopologyField {
    /// Variables tried in order: MVAPICH, Open MPI, SLURM.
    fn sources(&self) -> &'static [(&'static str, Parser)] {
        match self {
            TopologyField::LocalRank => LOCAL_RANK_SOURCES,
            TopologyField::LocalSize => LOCAL_SIZE_SOURCES,
            TopologyField::WorldRank => WORLD_RANK_SOURCES,
            TopologyField::WorldSize => WORLD_SIZE_SOURCES,
        }
    }

    fn default_value(&self) -> usize {
        match self {
            TopologyField::LocalRank | TopologyField::WorldRank => 0,
            TopologyField::LocalSize | TopologyField::WorldSize => 1,
        }
    }
}

impl fmt::Display for TopologyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyField::LocalRank => "local rank",
            TopologyField::LocalSize => "local size",
            TopologyField::WorldRank => "world rank",
            TopologyField::WorldSize => "world size",
        };
        f.write_str(name)
    }
}

fn parse_plain(raw: &str) -> Option<usize> {
    raw.trim().parse().ok()
}

/// SLURM may report task counts as `4(x2)`; the leading integer is the count.
fn parse_slurm_tasks(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let digits = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    raw[..digits].parse().ok()
}

/// Look up one field. `Ok(None)` means no source variable is set.
pub fn lookup_field<F>(field: TopologyField, lookup: &F) -> Result<Option<usize>, TopologyError>
where
    F: Fn(&str) -> Option<String>,
{
    for &(var, parse) in field.sources() {
        if let Some(raw) = lookup(var) {
            return parse(&raw).map(Some).ok_or(TopologyError::Invalid {
                field,
                var,
                value: raw,
            });
        }
    }
    Ok(None)
}

/// Look up one field, falling back to its single-process default unless `required`.
pub fn resolve_field<F>(field: TopologyField, required: bool, lookup: &F) -> Result<usize, TopologyError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup_field(field, lookup)? {
        Some(value) => Ok(value),
        None if required => Err(TopologyError::Unresolved(field)),
        None => Ok(field.default_value()),
    }
}

/// Where this process sits in the job. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub local_rank: usize,
    pub local_size: usize,
    pub world_rank: usize,
    pub world_size: usize,
}

impl Topology {
    pub fn single_process() -> Self {
        Self {
            local_rank: 0,
            local_size: 1,
            world_rank: 0,
            world_size: 1,
        }
    }

    /// Resolve from the process environment.
    pub fn from_env(required: bool) -> Result<Self, TopologyError> {
        Self::from_lookup(required, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(required: bool, lookup: F) -> Result<Self, TopologyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let topology = Self {
            local_rank: resolve_field(TopologyField::LocalRank, required, &lookup)?,
            local_size: resolve_field(TopologyField::LocalSize, required, &lookup)?,
            world_rank: resolve_field(TopologyField::WorldRank, required, &lookup)?,
            world_size: resolve_field(TopologyField::WorldSize, required, &lookup)?,
        };
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.world_size == 0 || self.world_rank >= self.world_size {
            return Err(TopologyError::Inconsistent(format!(
                "world rank {} with world size {}",
                self.world_rank, self.world_size
            )));
        }
        if self.local_size == 0 || self.local_rank >= self.local_size {
            return Err(TopologyError::Inconsistent(format!(
                "local rank {} with local size {}",
                self.local_rank, self.local_size
            )));
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.world_rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_single_process() {
        let topo = Topology::from_lookup(false, env(&[])).unwrap();
        assert_eq!(topo, Topology::single_process());
    }

    #[test]
    fn required_lookup_fails_on_empty_environment() {
        let err = Topology::from_lookup(true, env(&[])).unwrap_err();
        assert_eq!(err, TopologyError::Unresolved(TopologyField::LocalRank));
        assert_eq!(err.to_string(), "Could not get local rank");
    }

    #[test]
    fn mvapich_takes_precedence_over_openmpi_and_slurm() {
        let lookup = env(&[
            ("MV2_COMM_WORLD_RANK", "3"),
            ("OMPI_COMM_WORLD_RANK", "1"),
            ("SLURM_PROCID", "2"),
        ]);
        assert_eq!(resolve_field(TopologyField::WorldRank, true, &lookup).unwrap(), 3);
    }

    #[test]
    fn slurm_variables_resolve_full_topology() {
        let topo = Topology::from_lookup(
            true,
            env(&[
                ("SLURM_LOCALID", "1"),
                ("SLURM_NTASKS_PER_NODE", "4(x2)"),
                ("SLURM_PROCID", "5"),
                ("SLURM_NTASKS", "8"),
            ]),
        )
        .unwrap();
        assert_eq!(
            topo,
            Topology {
                local_rank: 1,
                local_size: 4,
                world_rank: 5,
                world_size: 8
            }
        );
        assert!(!topo.is_root());
    }

    #[test]
    fn malformed_value_is_an_error() {
        let lookup = env(&[("OMPI_COMM_WORLD_SIZE", "many")]);
        let err = resolve_field(TopologyField::WorldSize, false, &lookup).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::Invalid { var: "OMPI_COMM_WORLD_SIZE", .. }
        ));
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        let err = Topology::from_lookup(
            false,
            env(&[("OMPI_COMM_WORLD_RANK", "4"), ("OMPI_COMM_WORLD_SIZE", "4")]),
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::Inconsistent(_)));
    }

    #[test]
    fn lookup_field_reports_absence() {
        let lookup = env(&[]);
        assert_eq!(lookup_field(TopologyField::LocalSize, &lookup).unwrap(), None);
    }
}
