// src/config/mod.rs

//! Configuration loading and validation for multibuild.
//!
//! - `model.rs`: the TOML-backed data model.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: turning a raw config into a validated [`ConfigFile`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{config_root_dir, default_config_path, load_and_validate, load_from_path};
pub use model::{
    ConfigFile, DefaultSection, GroupSection, RawConfigFile, UnitConfig, WatchSection,
};
