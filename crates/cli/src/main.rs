// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use cosmoflow_formats::{CosmoHdf5Format, Format};
use cosmoflow_io_core::config::yaml_to_json;
use cosmoflow_io_core::generation::default_concurrency;
use cosmoflow_io_core::plan::TRAIN_SUBDIR;
use cosmoflow_io_core::{
    Backend, BenchConfig, BenchmarkRunner, DatasetGenerator, DistributedContext, DatasetLayout, IndexCatalog,
    RunPlan, Topology,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// cosmoflow-io: CosmoFlow HDF5 data-loading baseline for distributed training
#[derive(Parser, Debug)]
#[command(author, version, about, args_conflicts_with_subcommands = true)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

/// Benchmark options. Anything left unset falls back to `--config`, then to
/// the built-in defaults.
#[derive(ClapArgs, Debug, Default)]
struct RunArgs {
    /// Dataset root; samples are read from `<data_path>/train`
    #[arg(long = "data_path", alias = "data-path")]
    data_path: Option<PathBuf>,

    /// Per-rank batch size [default: 16]
    #[arg(long = "batch_size", alias = "batch-size")]
    batch_size: Option<usize>,

    /// Number of epochs [default: 3]
    #[arg(long)]
    nepochs: Option<usize>,

    /// Number of training samples [default: 3]
    #[arg(long)]
    nsamples: Option<usize>,

    /// YAML benchmark config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Loader worker threads per rank [default: 1]
    #[arg(long)]
    num_workers: Option<usize>,

    /// Normalize by mean instead of log1p
    #[arg(long)]
    no_log: bool,

    /// Seed for the shuffle plan (OS entropy when unset)
    #[arg(long)]
    seed: Option<u64>,

    /// Wrap around instead of dropping the tail when samples do not divide evenly across ranks
    #[arg(long)]
    pad_uneven: bool,

    /// Edge length of an unsplit universe [default: 512]
    #[arg(long)]
    base_universe_size: Option<u64>,

    /// Coordination backend: shmem, mpi or none [default: shmem]
    #[arg(long)]
    coordination: Option<Backend>,

    /// Shared id of all ranks in this job
    #[arg(long)]
    group_id: Option<String>,

    /// Rendezvous port published as MASTER_PORT [default: 2345]
    #[arg(long)]
    master_port: Option<u16>,

    /// Seconds to wait for every rank to join [default: 30]
    #[arg(long)]
    join_timeout: Option<u64>,

    /// Write the rank-0 report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    fn to_overrides(&self) -> BenchConfig {
        let mut cfg = BenchConfig::default();
        cfg.dataset.data_path = self.data_path.clone();
        cfg.dataset.base_universe_size = self.base_universe_size;
        cfg.dataset.nsamples = self.nsamples;
        cfg.dataset.apply_log = self.no_log.then_some(false);
        cfg.reader.batch_size = self.batch_size;
        cfg.reader.nepochs = self.nepochs;
        cfg.reader.read_threads = self.num_workers;
        cfg.reader.seed = self.seed;
        cfg.reader.pad_uneven = self.pad_uneven.then_some(true);
        cfg.coordination.backend = self.coordination;
        cfg.coordination.group_id = self.group_id.clone();
        cfg.coordination.master_port = self.master_port;
        cfg.coordination.join_timeout_secs = self.join_timeout;
        cfg
    }

    fn resolve(&self) -> Result<RunPlan> {
        let base = match &self.config {
            Some(path) => BenchConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config {:?}", path))?,
            None => BenchConfig::default(),
        };
        base.merge(self.to_overrides()).to_run_plan()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a synthetic CosmoFlow dataset under `<data_path>/train`
    Generate {
        /// Dataset root
        #[arg(long = "data_path", alias = "data-path")]
        data_path: PathBuf,

        /// Number of base universes
        #[arg(long, default_value_t = 2)]
        num_files: usize,

        /// Splits per base universe
        #[arg(long, default_value_t = 8)]
        num_splits: u64,

        /// Files per `NNN/` subdirectory; 0 writes a flat layout
        #[arg(long, default_value_t = 0)]
        num_subdirs: u64,

        /// Edge length of each generated cube
        #[arg(long, default_value_t = 32)]
        cube_size: usize,

        /// Length of the `unitPar` label vector
        #[arg(long, default_value_t = 4)]
        label_len: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Files written concurrently (defaults to the CPU count)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Validate a config and/or the sample index without running the benchmark
    Validate {
        /// YAML benchmark config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Dataset root to check (overrides the config)
        #[arg(long = "data_path", alias = "data-path")]
        data_path: Option<PathBuf>,

        /// Convert YAML to JSON and print it
        #[arg(long)]
        to_json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Ignore errors if .env doesn't exist

    let args = Args::parse();

    let log_level = if args.verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cosmoflow_io={0},cosmoflow_io_core={0},cosmoflow_formats={0}",
            log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("cosmoflow-io v{} starting", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        Some(Commands::Generate {
            data_path,
            num_files,
            num_splits,
            num_subdirs,
            cube_size,
            label_len,
            seed,
            concurrency,
        }) => {
            let layout = DatasetLayout {
                num_files,
                num_splits,
                num_subdirs,
                cube_size,
                label_len,
                seed,
            };
            run_generate(&data_path, layout, concurrency.unwrap_or_else(default_concurrency)).await
        }
        Some(Commands::Validate {
            config,
            data_path,
            to_json,
        }) => run_validate(config.as_deref(), data_path, to_json),
        None => run_benchmark(&args.run).await,
    };

    if let Err(e) = &result {
        error!("❌ {:#}", e);
    }
    result
}

async fn run_benchmark(run: &RunArgs) -> Result<()> {
    let plan = run.resolve()?;
    let output = run.output.clone();
    info!("Resolved run plan: {:?}", plan);

    let topology = Topology::from_env(false).context("Failed to resolve rank topology")?;
    let ctx = DistributedContext::establish(topology, &plan.coordination)?;
    let started_at = Utc::now();

    let runner = BenchmarkRunner::new(plan);
    runner.announce(&ctx);
    let shuffle = runner.shuffle_plan(&ctx)?;
    let mut loader = runner.build_loader(&ctx, shuffle)?;

    let loop_runner = runner.clone();
    let metrics = tokio::task::spawn_blocking(move || loop_runner.run_epochs(&mut loader))
        .await
        .context("Timing loop panicked")??;

    if ctx.topology().is_root() {
        let report = runner.report(&metrics, &ctx, started_at);
        report.print_summary();
        if let Some(path) = output {
            report.write_json(&path)?;
            info!("📄 Report written to {:?}", path);
        }
    }
    Ok(())
}

async fn run_generate(data_path: &Path, layout: DatasetLayout, concurrency: usize) -> Result<()> {
    let data_dir = data_path.join(TRAIN_SUBDIR);
    println!(
        "Generating {} universes x {} splits into {:?}",
        layout.num_files, layout.num_splits, data_dir
    );
    let summary = DatasetGenerator::new(&data_dir, layout).generate(concurrency).await?;
    println!(
        "✅ Generated {} files ({:.2} MB) in {:.2?}",
        summary.files,
        summary.bytes as f64 / 1024.0 / 1024.0,
        summary.elapsed
    );
    Ok(())
}

fn run_validate(config: Option<&Path>, data_path: Option<PathBuf>, to_json: bool) -> Result<()> {
    let mut cfg = BenchConfig::default();
    if let Some(path) = config {
        let yaml = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
        if to_json {
            println!("{}", yaml_to_json(&yaml)?);
        }
        cfg = BenchConfig::from_yaml(&yaml)?;
        println!("✅ Config {:?} parsed", path);
    }
    if data_path.is_some() {
        cfg.dataset.data_path = data_path;
    }
    if cfg.dataset.data_path.is_none() {
        return Ok(());
    }

    let plan = cfg.to_run_plan()?;
    let catalog = IndexCatalog::load(&plan.data_dir, plan.base_universe_size)?;
    println!(
        "✅ Index OK: {} files x {} splits = {} samples ({} layout, key '{}')",
        catalog.num_files(),
        catalog.num_splits(),
        catalog.sample_count(),
        if catalog.is_nested() { "nested" } else { "flat" },
        catalog.input_key()
    );

    if catalog.sample_count() > 0 {
        let first = catalog.locate(0)?;
        let sample = CosmoHdf5Format::reader(catalog.input_key()).read(&first.path)?;
        println!(
            "✅ First sample {:?}: input {:?}, label {:?}",
            first.path,
            sample.input.shape(),
            sample.label.shape()
        );
    }
    Ok(())
}
