// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/formats/src/lib.rs
//
pub mod hdf5;

pub use hdf5::{CosmoHdf5Format, CosmoSample, InputKey, LABEL_KEY};

/// A simple data-format interface.
pub trait Format {
    /// What a successful read yields.
    type Sample;

    /// Generate synthetic data and write to `path`.
    fn generate(&self, path: &std::path::Path) -> anyhow::Result<()>;
    /// Read & validate the data at `path`.
    fn read(&self, path: &std::path::Path) -> anyhow::Result<Self::Sample>;
}
