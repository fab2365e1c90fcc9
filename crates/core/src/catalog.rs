// src/catalog.rs
//
// The sample index written by the CosmoFlow preprocessing step, and the mapping
// from a global sample index to the file holding it.

use anyhow::{Context, Result};
use cosmoflow_formats::InputKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Name of the index file inside the data directory
pub const INDEX_FILENAME: &str = "idx";

/// Edge length of an unsplit universe
pub const DEFAULT_BASE_UNIVERSE_SIZE: u64 = 512;

/// First byte of a pickle stream (protocol 2 and later)
const PICKLE_PROTO: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Sample index {index} maps to base file {base_index} but the catalog lists {num_files} files")]
    OutOfRange {
        index: u64,
        base_index: u64,
        num_files: usize,
    },

    #[error("Invalid catalog: {0}")]
    Invalid(String),
}

/// On-disk layout of the `idx` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFile {
    pub filenames: Vec<String>,
    /// 0 or absent: every sample file sits directly in the data directory.
    #[serde(default)]
    pub num_subdirs: Option<u64>,
    pub split_size: u64,
    /// Pins the split count instead of deriving it from `split_size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_splits: Option<u64>,
}

impl IndexFile {
    /// Parse a pickled dict or a YAML/JSON mapping.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.first() == Some(&PICKLE_PROTO) {
            serde_pickle::from_slice(data, serde_pickle::DeOptions::new())
                .map_err(|e| anyhow::anyhow!("Failed to parse pickled index: {}", e))
        } else {
            serde_yaml::from_slice(data).map_err(|e| anyhow::anyhow!("Failed to parse index: {}", e))
        }
    }

    pub fn to_pickle(&self) -> Result<Vec<u8>> {
        serde_pickle::to_vec(self, serde_pickle::SerOptions::new())
            .map_err(|e| anyhow::anyhow!("Failed to pickle index: {}", e))
    }
}

/// Where one sample lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleLocation {
    pub base_index: u64,
    pub split_index: u64,
    pub path: PathBuf,
}

/// Loaded sample index for one data directory
#[derive(Debug, Clone)]
pub struct IndexCatalog {
    data_dir: PathBuf,
    filenames: Vec<String>,
    num_subdirs: u64,
    num_splits: u64,
}

impl IndexCatalog {
    /// Read `<data_dir>/idx`.
    pub fn load<P: AsRef<Path>>(data_dir: P, base_universe_size: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let index_path = data_dir.join(INDEX_FILENAME);
        let bytes = std::fs::read(&index_path)
            .with_context(|| format!("Failed to read sample index {:?}", index_path))?;
        let index = IndexFile::from_bytes(&bytes)
            .with_context(|| format!("Failed to parse sample index {:?}", index_path))?;
        let catalog = Self::from_index(data_dir, index, base_universe_size)?;
        debug!(
            "Loaded catalog {:?}: {} files x {} splits, {} subdirs",
            index_path,
            catalog.num_files(),
            catalog.num_splits(),
            catalog.num_subdirs
        );
        Ok(catalog)
    }

    pub fn from_index<P: AsRef<Path>>(
        data_dir: P,
        index: IndexFile,
        base_universe_size: u64,
    ) -> Result<Self, CatalogError> {
        let num_splits = match index.num_splits {
            Some(n) => n,
            None => {
                if index.split_size == 0 {
                    return Err(CatalogError::Invalid("split_size is 0".to_string()));
                }
                (base_universe_size / index.split_size).pow(3)
            }
        };
        if num_splits == 0 {
            return Err(CatalogError::Invalid(format!(
                "split_size {} is larger than the base universe ({})",
                index.split_size, base_universe_size
            )));
        }

        Ok(Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            filenames: index.filenames,
            num_subdirs: index.num_subdirs.unwrap_or(0),
            num_splits,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn num_files(&self) -> usize {
        self.filenames.len()
    }

    pub fn num_splits(&self) -> u64 {
        self.num_splits
    }

    pub fn num_subdirs(&self) -> u64 {
        self.num_subdirs
    }

    /// Samples the catalog can address: files times splits.
    pub fn sample_count(&self) -> u64 {
        self.filenames.len() as u64 * self.num_splits
    }

    pub fn is_nested(&self) -> bool {
        self.num_subdirs > 0
    }

    /// Nested files keep their cube under `split`, flat ones under `full`.
    pub fn input_key(&self) -> InputKey {
        if self.is_nested() {
            InputKey::Split
        } else {
            InputKey::Full
        }
    }

    pub fn decompose(&self, index: u64) -> (u64, u64) {
        (index / self.num_splits, index % self.num_splits)
    }

    /// Path of the file holding global sample `index`.
    pub fn locate(&self, index: u64) -> Result<SampleLocation, CatalogError> {
        let (base_index, split_index) = self.decompose(index);
        let base_name = self
            .filenames
            .get(base_index as usize)
            .ok_or(CatalogError::OutOfRange {
                index,
                base_index,
                num_files: self.filenames.len(),
            })?;

        let filename = format!("{}_{:03}.hdf5", base_name, split_index);
        let path = if self.is_nested() {
            let subdir = format!("{:03}", base_index / self.num_subdirs);
            self.data_dir.join(subdir).join(filename)
        } else {
            self.data_dir.join(filename)
        };

        Ok(SampleLocation {
            base_index,
            split_index,
            path,
        })
    }
}
