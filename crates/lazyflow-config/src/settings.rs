//! Engine settings file format and operations.

use serde::{Deserialize, Serialize};
use std::path::Path;

use lazyflow_core::GraphConfig;
use lazyflow_core::graph::default_threads;

use crate::error::ConfigError;

/// Environment variable overriding [`Settings::threads`].
pub const THREADS_ENV: &str = "LAZYFLOW_THREADS";

/// Environment variable overriding [`Settings::total_ram_mb`].
pub const TOTAL_RAM_ENV: &str = "LAZYFLOW_TOTAL_RAM_MB";

/// Smallest memory budget accepted, in MB. Smaller values are almost always
/// a GB figure typed into the MB field.
pub const MIN_TOTAL_RAM_MB: u64 = 500;

/// Engine settings.
///
/// # TOML Format
///
/// ```toml
/// threads = -1            # -1 = min(cpus, 8), 0 = synchronous
/// total_ram_mb = 0        # 0 = no budget
/// default_block_kb = 1024
/// log_filter = "info"
/// ```
///
/// Every key is optional; missing keys take the defaults shown above.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Worker threads; `-1` picks a count from the host, `0` runs synchronously.
    #[serde(default = "default_threads_setting")]
    pub threads: i64,

    /// Cache memory budget in MB; `0` disables eviction.
    #[serde(default)]
    pub total_ram_mb: u64,

    /// Target cache block size in KB when no block shape is given.
    #[serde(default = "default_block_kb")]
    pub default_block_kb: usize,

    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_threads_setting() -> i64 {
    -1
}

fn default_block_kb() -> usize {
    1024
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: default_threads_setting(),
            total_ram_mb: 0,
            default_block_kb: default_block_kb(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the settings to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the settings to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `LAZYFLOW_THREADS` and `LAZYFLOW_TOTAL_RAM_MB` from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(THREADS_ENV) {
            self.threads = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: THREADS_ENV,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(TOTAL_RAM_ENV) {
            self.total_ram_mb = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: TOTAL_RAM_ENV,
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    /// Check every setting against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads < -1 {
            return Err(ConfigError::invalid(
                "threads",
                format!("must be >= -1, got {}", self.threads),
            ));
        }
        if self.total_ram_mb != 0 && self.total_ram_mb < MIN_TOTAL_RAM_MB {
            return Err(ConfigError::invalid(
                "total_ram_mb",
                format!(
                    "{} MB is below the {MIN_TOTAL_RAM_MB} MB minimum (was a GB value meant?)",
                    self.total_ram_mb
                ),
            ));
        }
        if self.default_block_kb == 0 {
            return Err(ConfigError::invalid("default_block_kb", "must be > 0"));
        }
        Ok(())
    }

    /// Worker count after resolving `-1`.
    pub fn resolved_threads(&self) -> usize {
        if self.threads < 0 {
            default_threads()
        } else {
            self.threads as usize
        }
    }

    /// Validate and build the engine configuration.
    pub fn to_graph_config(&self) -> Result<GraphConfig, ConfigError> {
        self.validate()?;
        Ok(GraphConfig {
            threads: self.resolved_threads(),
            memory_budget: (self.total_ram_mb > 0)
                .then(|| self.total_ram_mb as usize * 1024 * 1024),
            default_block_bytes: self.default_block_kb * 1024,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.threads, -1);
        assert_eq!(settings.total_ram_mb, 0);
        assert_eq!(settings.default_block_kb, 1024);
        assert_eq!(settings.log_filter, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Settings::from_toml("").unwrap(), Settings::default());
    }

    #[test]
    fn test_partial_toml() {
        let settings = Settings::from_toml("threads = 4\nlog_filter = \"debug\"").unwrap();
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.log_filter, "debug");
        assert_eq!(settings.default_block_kb, 1024);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            Settings::from_toml("threads = \"four\""),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = Settings {
            threads: 2,
            total_ram_mb: 2048,
            default_block_kb: 256,
            log_filter: "lazyflow_core=debug".into(),
        };
        let text = settings.to_toml().unwrap();
        assert!(text.contains("total_ram_mb = 2048"));
        assert_eq!(Settings::from_toml(&text).unwrap(), settings);
    }

    #[test]
    fn test_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(env(&[(THREADS_ENV, "0"), (TOTAL_RAM_ENV, " 1024 ")]))
            .unwrap();
        assert_eq!(settings.threads, 0);
        assert_eq!(settings.total_ram_mb, 1024);
    }

    #[test]
    fn test_override_missing_leaves_value() {
        let mut settings = Settings {
            threads: 3,
            ..Settings::default()
        };
        settings.apply_overrides(env(&[])).unwrap();
        assert_eq!(settings.threads, 3);
    }

    #[test]
    fn test_override_unparsable() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(env(&[(THREADS_ENV, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: THREADS_ENV, .. }));
    }

    #[test]
    fn test_validate_threads() {
        let settings = Settings {
            threads: -2,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "threads", .. })
        ));
    }

    #[test]
    fn test_validate_small_budget() {
        let mut settings = Settings {
            total_ram_mb: 8,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid {
                field: "total_ram_mb",
                ..
            })
        ));
        settings.total_ram_mb = MIN_TOTAL_RAM_MB;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_block_size() {
        let settings = Settings {
            default_block_kb: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_graph_config() {
        let settings = Settings {
            threads: 0,
            total_ram_mb: 512,
            default_block_kb: 64,
            log_filter: "info".into(),
        };
        let config = settings.to_graph_config().unwrap();
        assert_eq!(config.threads, 0);
        assert_eq!(config.memory_budget, Some(512 * 1024 * 1024));
        assert_eq!(config.default_block_bytes, 64 * 1024);

        let config = Settings::default().to_graph_config().unwrap();
        assert_eq!(config.threads, default_threads());
        assert_eq!(config.memory_budget, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lazyflow.toml");
        let settings = Settings {
            threads: 6,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
