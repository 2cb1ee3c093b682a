// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    debug!(path = %path.display(), units = config.unit.len(), "config parsed");
    Ok(config)
}

/// Load a configuration file and validate it.
///
/// Checks for:
/// - at least one unit,
/// - sane `[group]` and `[watch]` values,
/// - non-empty commands and compilable glob patterns,
/// - unknown, duplicate or circular dependencies.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    ConfigFile::try_from(raw_config)
}

/// `Multibuild.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Multibuild.toml")
}

/// Directory unit commands run in and patterns are relative to.
///
/// That is the config file's directory, or the current directory for a bare
/// file name.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}
