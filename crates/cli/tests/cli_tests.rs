// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// End-to-end runs of the cosmoflow-io binary: generate a small dataset, then
// benchmark it as a single process.
use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;
use walkdir::WalkDir;

fn cosmoflow_io(args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_cosmoflow-io"))
        .args(args)
        .env_remove("OMPI_COMM_WORLD_SIZE")
        .env_remove("SLURM_NTASKS")
        .output()?;
    Ok(output)
}

fn skip_hdf5() -> bool {
    std::env::var("SKIP_HDF5_TESTS").is_ok()
}

fn generate(root: &Path, extra: &[&str]) -> Result<()> {
    let root = root.to_string_lossy();
    let mut args = vec!["generate", "--data_path", root.as_ref(), "--cube-size", "4", "--seed", "3"];
    args.extend_from_slice(extra);
    let output = cosmoflow_io(&args)?;
    assert!(
        output.status.success(),
        "generate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

#[test]
fn test_generate_writes_index_and_samples() -> Result<()> {
    if skip_hdf5() {
        return Ok(());
    }
    let temp_dir = TempDir::new()?;
    generate(temp_dir.path(), &["--num-files", "2", "--num-splits", "4"])?;

    let train = temp_dir.path().join("train");
    assert!(train.join("idx").exists());
    let hdf5_files = WalkDir::new(&train)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "hdf5"))
        .count();
    assert_eq!(hdf5_files, 8);
    Ok(())
}

#[test]
fn test_benchmark_run_prints_summary_and_report() -> Result<()> {
    if skip_hdf5() {
        return Ok(());
    }
    let temp_dir = TempDir::new()?;
    generate(temp_dir.path(), &["--num-files", "1", "--num-splits", "4"])?;

    let report_path = temp_dir.path().join("report.json");
    let root = temp_dir.path().to_string_lossy().to_string();
    let report = report_path.to_string_lossy().to_string();
    let output = cosmoflow_io(&[
        "--data_path",
        &root,
        "--batch_size",
        "2",
        "--nepochs",
        "2",
        "--nsamples",
        "4",
        "--coordination",
        "none",
        "--output",
        &report,
    ])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(stdout.contains("number of training:4"));
    assert!(stdout.contains("Will have 2 steps."));
    assert!(stdout.contains("Number of Processes used: 1"));
    assert!(stdout.contains("Number of Epochs: 2"));
    assert!(stdout.contains("Batch Size: 2"));
    assert!(stdout.contains("DataLoading time baseline each epoch: ["));

    let json: Value = serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
    assert_eq!(json["samples_loaded"], 8);
    assert_eq!(json["batches"], 4);
    assert_eq!(json["backend"], "none");
    Ok(())
}

#[test]
fn test_missing_index_fails_the_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let root = temp_dir.path().to_string_lossy().to_string();
    let output = cosmoflow_io(&["--data_path", &root, "--coordination", "none"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("idx"));
    Ok(())
}

#[test]
fn test_validate_converts_yaml_to_json() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = temp_dir.path().join("bench.yaml");
    std::fs::write(&config, "reader:\n  batch_size: 8\n  nepochs: 6\n")?;

    let output = cosmoflow_io(&["validate", "--config", &config.to_string_lossy(), "--to-json"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"batch_size\": 8"));
    assert!(stdout.contains("parsed"));
    Ok(())
}
