//! Core library for the CosmoFlow I/O benchmark: rank discovery, process-group
//! bootstrap, shuffle-plan broadcast and the sharded HDF5 sample loader.

pub mod benchmark;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod coordination;
pub mod dataset;
pub mod generation;
pub mod loader;
pub mod metrics;
pub mod plan;
pub mod sampler;
pub mod shuffle;
pub mod topology;
pub mod transform;

pub use benchmark::{BenchmarkRunner, SNAPSHOT_EPOCH};
pub use bootstrap::{Backend, Capability, CoordinationOptions, DistributedContext, Rendezvous};
pub use catalog::{CatalogError, IndexCatalog, IndexFile, SampleLocation};
pub use config::BenchConfig;
pub use dataset::{CosmoDataset, Sample};
pub use generation::{DatasetGenerator, DatasetLayout, GenerationSummary};
pub use loader::{Batch, DataLoader};
pub use metrics::{BenchmarkReport, EpochMetrics, Metrics};
pub use plan::RunPlan;
pub use sampler::{DistributedSampler, ShardPolicy};
pub use shuffle::{PlanError, ShufflePlan};
pub use topology::{Topology, TopologyError, TopologyField};
pub use transform::{CosmoFlowTransform, Transform};
