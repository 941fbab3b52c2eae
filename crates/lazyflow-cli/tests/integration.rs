//! Integration tests for lazyflow-cli.
//!
//! Tests invoke the built binary with a throwaway settings file so the
//! user's own settings never leak in.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to get the path to the `lazyflow` binary built by cargo.
fn lazyflow_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lazyflow"));
    cmd.env_remove("RUST_LOG")
        .env_remove("LAZYFLOW_THREADS")
        .env_remove("LAZYFLOW_TOTAL_RAM_MB");
    cmd
}

fn settings_file(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("lazyflow.toml");
    std::fs::write(&path, content).unwrap();
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    lazyflow_bin()
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run lazyflow")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "lazyflow failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ---------------------------------------------------------------------------
// `lazyflow blocks`
// ---------------------------------------------------------------------------

#[test]
fn cli_blocks_single_block() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 0\n");
    let out = stdout(&run(
        &config,
        &["blocks", "--shape", "25,25", "--block", "10,10", "--roi", "[3:7,3:7]"],
    ));
    assert!(out.contains("1 block(s) intersect [3:7,3:7]"), "{out}");
    assert!(out.contains("[0, 0]"));
    assert!(out.contains("[0:10,0:10]"));
}

#[test]
fn cli_blocks_clamps_edge_blocks() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 0\n");
    let out = stdout(&run(
        &config,
        &["blocks", "--shape", "25,25", "--block", "10,10", "--roi", "[8:12,18:25]"],
    ));
    assert!(out.contains("4 block(s)"), "{out}");
    assert!(out.contains("[1, 2]"));
    assert!(out.contains("[10:20,20:25]"));
}

#[test]
fn cli_blocks_rejects_outside_region() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 0\n");
    let output = run(
        &config,
        &["blocks", "--shape", "25,25", "--block", "10,10", "--roi", "[20:30,0:5]"],
    );
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `lazyflow config`
// ---------------------------------------------------------------------------

#[test]
fn cli_config_shows_file_settings() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 3\ndefault_block_kb = 64\n");
    let out = stdout(&run(&config, &["config"]));
    assert!(out.contains("# source:"));
    assert!(out.contains("threads = 3"));
    assert!(out.contains("default_block_kb = 64"));
    assert!(out.contains("log_filter = \"info\""));
}

#[test]
fn cli_config_env_override() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 3\n");
    let output = lazyflow_bin()
        .env("LAZYFLOW_THREADS", "0")
        .arg("--config")
        .arg(&config)
        .arg("config")
        .output()
        .unwrap();
    assert!(stdout(&output).contains("threads = 0"));
}

#[test]
fn cli_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    let output = run(&dir.path().join("absent.toml"), &["config"]);
    assert!(!output.status.success());
}

#[test]
fn cli_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "total_ram_mb = 4\n");
    let output = run(&config, &["config"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("total_ram_mb"));
}

// ---------------------------------------------------------------------------
// `lazyflow bench`
// ---------------------------------------------------------------------------

#[test]
fn cli_bench_fetches_each_block_once() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 0\n");
    let out = stdout(&run(
        &config,
        &[
            "bench", "--shape", "32,32", "--block", "16,16", "--tile", "8", "--passes", "2",
        ],
    ));
    assert!(out.contains("Fetches:      4"), "{out}");
    assert!(out.contains("Pass 2:"));
}

// ---------------------------------------------------------------------------
// `lazyflow labels`
// ---------------------------------------------------------------------------

fn summary(out: &str) -> Vec<String> {
    out.lines()
        .skip_while(|line| !line.contains("Max label"))
        .filter(|line| !line.starts_with("Exported"))
        .map(str::to_string)
        .collect()
}

#[test]
fn cli_labels_export_then_import() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 0\n");
    let json = dir.path().join("labels.json");
    let json_arg = json.to_str().unwrap();

    let painted = stdout(&run(
        &config,
        &["labels", "--shape", "32,32", "--block", "8,8", "--out", json_arg],
    ));
    assert!(painted.contains("Max label:       3"), "{painted}");
    assert!(json.exists());

    let imported = stdout(&run(
        &config,
        &["labels", "--shape", "32,32", "--block", "8,8", "--input", json_arg],
    ));
    assert!(imported.contains("Imported"));
    assert_eq!(summary(&painted), summary(&imported));
}

#[test]
fn cli_labels_needs_two_axes() {
    let dir = TempDir::new().unwrap();
    let config = settings_file(&dir, "threads = 0\n");
    let output = run(&config, &["labels", "--shape", "8,8,8", "--block", "4,4,4"]);
    assert!(!output.status.success());
}
