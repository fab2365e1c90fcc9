// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/formats/src/hdf5.rs
//
// CosmoFlow per-split HDF5 samples: an int16 density cube plus the `unitPar`
// label vector.

use anyhow::{Context, Result};
use hdf5_metno::File;
use ndarray::{Array1, ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::path::Path;

use crate::Format;

/// Dataset holding the cosmological parameters of a sample.
pub const LABEL_KEY: &str = "unitPar";

/// Upper bound (exclusive) for synthetic particle counts.
const SYNTHETIC_MAX_COUNT: i16 = 256;

/// Name of the dataset holding the input cube.
///
/// Files living under a fan-out subdirectory store the cube as `split`,
/// files in a flat layout store it as `full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKey {
    Split,
    Full,
}

impl InputKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKey::Split => "split",
            InputKey::Full => "full",
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample as stored on disk.
#[derive(Debug, Clone)]
pub struct CosmoSample {
    pub input: ArrayD<i16>,
    pub label: ArrayD<f32>,
}

/// HDF5 format generator and reader for CosmoFlow samples
#[derive(Debug, Clone)]
pub struct CosmoHdf5Format {
    input_key: InputKey,
    shape: Option<Vec<usize>>,
    label_len: usize,
    seed: u64,
}

impl CosmoHdf5Format {
    /// A reader that accepts any cube shape stored under `input_key`.
    pub fn reader(input_key: InputKey) -> Self {
        CosmoHdf5Format {
            input_key,
            shape: None,
            label_len: 0,
            seed: 0,
        }
    }

    /// Create with the desired cube `shape` and label length.
    pub fn new(input_key: InputKey, shape: Vec<usize>, label_len: usize) -> Self {
        CosmoHdf5Format {
            input_key,
            shape: Some(shape),
            label_len,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn input_key(&self) -> InputKey {
        self.input_key
    }

    /// Build a synthetic sample: Poisson-ish particle counts and unit parameters.
    fn create_synthetic_sample(&self, shape: &[usize]) -> Result<CosmoSample> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let total_elements = shape.iter().product::<usize>();

        let counts: Vec<i16> = (0..total_elements)
            .map(|_| rng.random_range(0..SYNTHETIC_MAX_COUNT))
            .collect();
        let input = ArrayD::from_shape_vec(IxDyn(shape), counts)
            .with_context(|| "Failed to reshape synthetic cube")?;

        let label = Array1::from_iter((0..self.label_len).map(|_| rng.random::<f32>())).into_dyn();

        Ok(CosmoSample { input, label })
    }
}

impl Format for CosmoHdf5Format {
    type Sample = CosmoSample;

    fn generate(&self, path: &Path) -> Result<()> {
        let shape = self
            .shape
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No sample shape configured for generation"))?;

        let sample = self.create_synthetic_sample(shape)?;

        let file = File::create(path)
            .with_context(|| format!("Failed to create HDF5 file at {:?}", path))?;

        let cube = file
            .new_dataset::<i16>()
            .shape(shape.clone())
            .create(self.input_key.as_str())
            .with_context(|| format!("Failed to create dataset '{}'", self.input_key))?;
        cube.write(&sample.input)
            .with_context(|| "Failed to write synthetic cube")?;

        let label = file
            .new_dataset::<f32>()
            .shape(self.label_len)
            .create(LABEL_KEY)
            .with_context(|| format!("Failed to create dataset '{}'", LABEL_KEY))?;
        label
            .write(&sample.label)
            .with_context(|| "Failed to write synthetic labels")?;

        Ok(())
    }

    fn read(&self, path: &Path) -> Result<CosmoSample> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open HDF5 file at {:?}", path))?;

        let input: ArrayD<i16> = file
            .dataset(self.input_key.as_str())
            .with_context(|| format!("Failed to open dataset '{}' in {:?}", self.input_key, path))?
            .read()
            .with_context(|| format!("Failed to read dataset '{}' in {:?}", self.input_key, path))?;

        let label: ArrayD<f32> = file
            .dataset(LABEL_KEY)
            .with_context(|| format!("Failed to open dataset '{}' in {:?}", LABEL_KEY, path))?
            .read()
            .with_context(|| format!("Failed to read dataset '{}' in {:?}", LABEL_KEY, path))?;

        if let Some(shape) = &self.shape {
            if input.shape() != shape.as_slice() {
                anyhow::bail!(
                    "HDF5 cube shape mismatch in {:?}: expected {:?}, got {:?}",
                    path,
                    shape,
                    input.shape()
                );
            }
        }

        Ok(CosmoSample { input, label })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hdf5_generate_and_read() {
        // Skip test if HDF5 is not available
        if std::env::var("SKIP_HDF5_TESTS").is_ok() {
            return;
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("univ_000.hdf5");
        let fmt = CosmoHdf5Format::new(InputKey::Full, vec![4, 4, 4, 2], 4).with_seed(7);

        fmt.generate(&path).unwrap();
        let sample = fmt.read(&path).unwrap();

        assert_eq!(sample.input.shape(), &[4, 4, 4, 2]);
        assert_eq!(sample.label.shape(), &[4]);
        assert!(sample.input.iter().all(|&v| (0..SYNTHETIC_MAX_COUNT).contains(&v)));
    }

    #[test]
    fn hdf5_reader_rejects_wrong_key() {
        if std::env::var("SKIP_HDF5_TESTS").is_ok() {
            return;
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("univ_001.hdf5");
        CosmoHdf5Format::new(InputKey::Full, vec![2, 2, 2], 4)
            .generate(&path)
            .unwrap();

        let err = CosmoHdf5Format::reader(InputKey::Split).read(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("split"));
    }

    #[test]
    fn synthetic_samples_follow_seed() {
        let a = CosmoHdf5Format::new(InputKey::Split, vec![3, 3], 2).with_seed(11);
        let b = CosmoHdf5Format::new(InputKey::Split, vec![3, 3], 2).with_seed(11);
        let sa = a.create_synthetic_sample(&[3, 3]).unwrap();
        let sb = b.create_synthetic_sample(&[3, 3]).unwrap();
        assert_eq!(sa.input, sb.input);
        assert_eq!(sa.label, sb.label);
    }

    #[test]
    fn read_missing_file_reports_path() {
        let err = CosmoHdf5Format::reader(InputKey::Full)
            .read(Path::new("/nonexistent/univ_000.hdf5"))
            .unwrap_err();
        assert!(format!("{}", err).contains("univ_000.hdf5"));
    }
}
