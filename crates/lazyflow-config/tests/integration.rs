//! Integration tests for lazyflow-config.
//!
//! Settings files on disk driving real graphs.

use lazyflow_config::{ConfigError, Settings, find_settings};
use lazyflow_core::Graph;
use tempfile::TempDir;

#[test]
fn test_settings_file_configures_graph() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lazyflow.toml");
    std::fs::write(&path, "threads = 0\ntotal_ram_mb = 600\ndefault_block_kb = 4\n").unwrap();

    let found = find_settings(Some(&path)).unwrap();
    let settings = Settings::load(found).unwrap();
    let graph = Graph::new(settings.to_graph_config().unwrap());

    assert_eq!(graph.memory().budget(), Some(600 * 1024 * 1024));
    assert_eq!(graph.context().config().threads, 0);
    assert_eq!(graph.context().config().default_block_bytes, 4096);
}

#[test]
fn test_env_override_wins_over_file() {
    let mut settings = Settings::from_toml("threads = 2\n").unwrap();
    settings
        .apply_overrides(|var| (var == "LAZYFLOW_THREADS").then(|| "0".to_string()))
        .unwrap();
    assert_eq!(settings.to_graph_config().unwrap().threads, 0);
}

#[test]
fn test_invalid_file_refuses_graph_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lazyflow.toml");
    std::fs::write(&path, "total_ram_mb = 16\n").unwrap();

    let settings = Settings::load(&path).unwrap();
    assert!(matches!(
        settings.to_graph_config(),
        Err(ConfigError::Invalid { .. })
    ));
}

#[test]
fn test_saved_defaults_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cfg").join("lazyflow.toml");
    Settings::default().save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("threads = -1"));
    assert_eq!(Settings::load(&path).unwrap(), Settings::default());
}
