//! Settings management for the lazyflow engine.
//!
//! This crate loads the engine settings file, applies environment overrides
//! and turns the result into a [`lazyflow_core::GraphConfig`].
//!
//! # Features
//!
//! - **Settings file**: `threads`, `total_ram_mb`, `default_block_kb` and
//!   `log_filter` in TOML, every key optional
//! - **Environment overrides**: `LAZYFLOW_THREADS`, `LAZYFLOW_TOTAL_RAM_MB`
//! - **Validation**: range checks before a graph is built
//! - **Paths**: platform-specific location of `lazyflow.toml`
//!
//! # Example
//!
//! ```rust,no_run
//! use lazyflow_config::{Settings, paths};
//! use lazyflow_core::Graph;
//!
//! let mut settings = match paths::find_settings(None) {
//!     Some(path) => Settings::load(path).unwrap(),
//!     None => Settings::default(),
//! };
//! settings.apply_env().unwrap();
//! let graph = Graph::new(settings.to_graph_config().unwrap());
//! ```

mod error;
mod settings;

/// Platform-specific paths for the settings file.
pub mod paths;

pub use error::ConfigError;
pub use paths::{ensure_user_config_dir, find_settings, settings_path, user_config_dir};
pub use settings::{MIN_TOTAL_RAM_MB, Settings, THREADS_ENV, TOTAL_RAM_ENV};
