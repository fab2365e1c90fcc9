// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/core/src/config/bench_config.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bootstrap::Backend;

/// Benchmark configuration as written in YAML. Every field is optional so
/// command-line flags can fill in or override any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BenchConfig {
    #[serde(default)]
    pub dataset: Dataset,
    #[serde(default)]
    pub reader: Reader,
    #[serde(default)]
    pub coordination: Coordination,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub data_path: Option<PathBuf>, // directory containing `train/`
    pub base_universe_size: Option<u64>,
    pub apply_log: Option<bool>,
    pub nsamples: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reader {
    pub batch_size: Option<usize>,
    pub nepochs: Option<usize>,
    pub read_threads: Option<usize>,
    pub seed: Option<u64>,
    pub pad_uneven: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordination {
    pub backend: Option<Backend>,
    pub group_id: Option<String>,
    pub master_port: Option<u16>,
    pub join_timeout_secs: Option<u64>,
}

impl BenchConfig {
    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        serde_yaml::from_str(yaml_str).map_err(|e| anyhow::anyhow!("Failed to parse benchmark config: {}", e))
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path.as_ref(), e))?;
        Self::from_yaml(&text)
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merge(self, overrides: BenchConfig) -> Self {
        Self {
            dataset: Dataset {
                data_path: overrides.dataset.data_path.or(self.dataset.data_path),
                base_universe_size: overrides.dataset.base_universe_size.or(self.dataset.base_universe_size),
                apply_log: overrides.dataset.apply_log.or(self.dataset.apply_log),
                nsamples: overrides.dataset.nsamples.or(self.dataset.nsamples),
            },
            reader: Reader {
                batch_size: overrides.reader.batch_size.or(self.reader.batch_size),
                nepochs: overrides.reader.nepochs.or(self.reader.nepochs),
                read_threads: overrides.reader.read_threads.or(self.reader.read_threads),
                seed: overrides.reader.seed.or(self.reader.seed),
                pad_uneven: overrides.reader.pad_uneven.or(self.reader.pad_uneven),
            },
            coordination: Coordination {
                backend: overrides.coordination.backend.or(self.coordination.backend),
                group_id: overrides.coordination.group_id.or(self.coordination.group_id),
                master_port: overrides.coordination.master_port.or(self.coordination.master_port),
                join_timeout_secs: overrides
                    .coordination
                    .join_timeout_secs
                    .or(self.coordination.join_timeout_secs),
            },
        }
    }

    pub fn to_run_plan(&self) -> Result<crate::plan::RunPlan> {
        crate::plan::RunPlan::from_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
dataset:
  data_path: /lustre/cosmoUniverse_2019_05_4parE
  apply_log: false
  nsamples: 1024
reader:
  batch_size: 4
  nepochs: 6
  read_threads: 8
coordination:
  backend: none
"#;
        let config = BenchConfig::from_yaml(yaml).expect("Should parse YAML");
        assert_eq!(
            config.dataset.data_path,
            Some(PathBuf::from("/lustre/cosmoUniverse_2019_05_4parE"))
        );
        assert_eq!(config.dataset.apply_log, Some(false));
        assert_eq!(config.reader.batch_size, Some(4));
        assert_eq!(config.reader.read_threads, Some(8));
        assert_eq!(config.coordination.backend, Some(Backend::None));
        assert_eq!(config.reader.seed, None);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config = BenchConfig::from_yaml("{}").unwrap();
        assert_eq!(config, BenchConfig::default());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(BenchConfig::from_yaml("coordination:\n  backend: tcp\n").is_err());
    }

    #[test]
    fn overrides_win_over_file_values() {
        let file = BenchConfig::from_yaml("reader:\n  batch_size: 4\n  nepochs: 6\n").unwrap();
        let mut cli = BenchConfig::default();
        cli.reader.batch_size = Some(32);

        let merged = file.merge(cli);
        assert_eq!(merged.reader.batch_size, Some(32));
        assert_eq!(merged.reader.nepochs, Some(6));
    }
}
