// src/generation.rs
//
// Synthetic CosmoFlow dataset generation: an `idx` catalog plus one HDF5 file
// per (base universe, split).

use anyhow::{Context, Result};
use cosmoflow_formats::{CosmoHdf5Format, Format};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::catalog::{IndexCatalog, IndexFile, DEFAULT_BASE_UNIVERSE_SIZE, INDEX_FILENAME};

/// Shape of the dataset to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    pub num_files: usize,
    pub num_splits: u64,
    /// Files per `{:03}` subdirectory; 0 writes a flat layout.
    pub num_subdirs: u64,
    /// Edge length of each generated cube.
    pub cube_size: usize,
    pub label_len: usize,
    pub seed: u64,
}

impl Default for DatasetLayout {
    fn default() -> Self {
        Self {
            num_files: 2,
            num_splits: 8,
            num_subdirs: 0,
            cube_size: 32,
            label_len: 4,
            seed: 0,
        }
    }
}

impl DatasetLayout {
    pub fn total_samples(&self) -> u64 {
        self.num_files as u64 * self.num_splits
    }

    fn index(&self) -> IndexFile {
        IndexFile {
            filenames: (0..self.num_files).map(|i| format!("univ_{:06}", i)).collect(),
            num_subdirs: Some(self.num_subdirs),
            split_size: self.cube_size as u64,
            num_splits: Some(self.num_splits),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationSummary {
    pub files: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

pub struct DatasetGenerator {
    data_dir: PathBuf,
    layout: DatasetLayout,
}

impl DatasetGenerator {
    /// `data_dir` is the directory the benchmark reads, i.e. `<root>/train`.
    pub fn new<P: AsRef<Path>>(data_dir: P, layout: DatasetLayout) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            layout,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Write the index and return the catalog describing it.
    fn write_index(&self) -> Result<IndexCatalog> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;

        let index = self.layout.index();
        let index_path = self.data_dir.join(INDEX_FILENAME);
        std::fs::write(&index_path, index.to_pickle()?)
            .with_context(|| format!("Failed to write index {:?}", index_path))?;
        info!("Wrote index {:?} ({} base files)", index_path, self.layout.num_files);

        Ok(IndexCatalog::from_index(&self.data_dir, index, DEFAULT_BASE_UNIVERSE_SIZE)?)
    }

    /// Everything needed to write sample `idx` on any thread.
    fn sample_job(&self, catalog: &IndexCatalog, idx: u64) -> Result<(PathBuf, CosmoHdf5Format)> {
        let location = catalog.locate(idx)?;
        let cube = self.layout.cube_size;
        let format = CosmoHdf5Format::new(catalog.input_key(), vec![cube, cube, cube], self.layout.label_len)
            .with_seed(self.layout.seed.wrapping_add(idx));
        Ok((location.path, format))
    }

    /// Generate sequentially on the calling thread.
    pub fn generate_blocking(&self) -> Result<GenerationSummary> {
        let start = Instant::now();
        let catalog = self.write_index()?;
        let mut summary = GenerationSummary::default();

        for idx in 0..catalog.sample_count() {
            let (path, format) = self.sample_job(&catalog, idx)?;
            summary.bytes += write_sample(&path, &format)?;
            summary.files += 1;
        }

        summary.elapsed = start.elapsed();
        Ok(summary)
    }

    /// Generate with up to `concurrency` files in flight on blocking tasks.
    pub async fn generate(&self, concurrency: usize) -> Result<GenerationSummary> {
        let start = Instant::now();
        let catalog = self.write_index()?;
        let total = catalog.sample_count() as usize;
        let concurrency = concurrency.clamp(1, total.max(1));

        info!(
            "🚀 Generating {} sample files ({}^3 cubes) with {} concurrent workers",
            total, self.layout.cube_size, concurrency
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(total);
        for idx in 0..catalog.sample_count() {
            let (path, format) = self.sample_job(&catalog, idx)?;
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("Generation semaphore closed")?;
                tokio::task::spawn_blocking(move || write_sample(&path, &format))
                    .await
                    .context("Generation task panicked")?
            }));
        }

        let mut summary = GenerationSummary::default();
        for handle in handles {
            match handle.await.context("Generation task panicked")? {
                Ok(bytes) => {
                    summary.files += 1;
                    summary.bytes += bytes;
                    if summary.files % 50 == 0 || summary.files == total {
                        debug!("⏳ Progress: {}/{} files", summary.files, total);
                    }
                }
                Err(e) => {
                    error!("❌ File generation failed: {:#}", e);
                    return Err(e);
                }
            }
        }

        summary.elapsed = start.elapsed();
        info!(
            "✅ Generated {} files, {:.2} MB in {:?}",
            summary.files,
            summary.bytes as f64 / 1024.0 / 1024.0,
            summary.elapsed
        );
        Ok(summary)
    }
}

/// Default generation concurrency.
pub fn default_concurrency() -> usize {
    num_cpus::get()
}

fn write_sample(path: &Path, format: &CosmoHdf5Format) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    format
        .generate(path)
        .with_context(|| format!("Failed to generate sample file {:?}", path))?;
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to get metadata for {:?}", path))?
        .len();
    Ok(size)
}
