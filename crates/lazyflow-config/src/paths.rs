//! Platform-specific paths for the settings file.
//!
//! # Directory Structure
//!
//! - **User config**: `~/.config/lazyflow/` (Linux), `~/Library/Application Support/lazyflow/` (macOS), `%APPDATA%\lazyflow\` (Windows)
//! - **Settings file**: `lazyflow.toml` inside the user config directory
//!
//! # Example
//!
//! ```rust,no_run
//! use lazyflow_config::paths;
//!
//! match paths::find_settings(None) {
//!     Some(path) => println!("Using settings at {:?}", path),
//!     None => println!("Using built-in defaults"),
//! }
//! ```

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Application name used for directory paths.
const APP_NAME: &str = "lazyflow";

/// File name of the settings file.
pub const SETTINGS_FILE: &str = "lazyflow.toml";

/// Returns the user-specific configuration directory.
///
/// Returns a fallback path if the config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the settings file.
pub fn settings_path() -> PathBuf {
    user_config_dir().join(SETTINGS_FILE)
}

/// Find the settings file to load.
///
/// An explicit path wins when it names an existing file; otherwise the user
/// settings file is used if present. `None` means no file was found and the
/// defaults apply.
pub fn find_settings(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    let user = settings_path();
    user.is_file().then_some(user)
}

/// Create the user configuration directory if it does not exist.
pub fn ensure_user_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = user_config_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::create_dir(&dir, e))?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_path_is_under_config_dir() {
        let path = settings_path();
        assert!(path.starts_with(user_config_dir()));
        assert!(path.ends_with(SETTINGS_FILE));
    }

    #[test]
    fn test_user_config_dir_ends_with_app_name() {
        assert!(user_config_dir().ends_with(APP_NAME));
    }

    #[test]
    fn test_find_settings_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        assert_eq!(find_settings(Some(&path)), None);

        std::fs::write(&path, "threads = 0\n").unwrap();
        assert_eq!(find_settings(Some(&path)), Some(path.clone()));
    }

    #[test]
    fn test_find_settings_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_settings(Some(dir.path())), None);
    }
}
