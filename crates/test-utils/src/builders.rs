#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use multibuild::config::{ConfigFile, RawConfigFile, UnitConfig};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_unit(mut self, name: &str, unit: UnitConfig) -> Self {
        self.config.unit.insert(name.to_string(), unit);
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.config.group.parallelism = Some(n);
        self
    }

    pub fn with_aggregate_timeout_ms(mut self, ms: u64) -> Self {
        self.config.watch.aggregate_timeout_ms = Some(ms);
        self
    }

    pub fn with_global_watch(mut self, pattern: &str) -> Self {
        self.config.default.watch.push(pattern.to_string());
        self
    }

    pub fn with_global_exclude(mut self, pattern: &str) -> Self {
        self.config.default.exclude.push(pattern.to_string());
        self
    }

    pub fn with_default_use_hash(mut self, val: bool) -> Self {
        self.config.default.use_hash = Some(val);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `UnitConfig`.
pub struct UnitConfigBuilder {
    unit: UnitConfig,
}

impl UnitConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            unit: UnitConfig::new(cmd),
        }
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.unit.dependencies.push(dep.to_string());
        self
    }

    pub fn watch(mut self, pattern: &str) -> Self {
        self.unit
            .watch
            .get_or_insert_with(Vec::new)
            .push(pattern.to_string());
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.unit
            .exclude
            .get_or_insert_with(Vec::new)
            .push(pattern.to_string());
        self
    }

    pub fn append_default_watch(mut self, val: bool) -> Self {
        self.unit.append_default_watch = val;
        self
    }

    pub fn use_hash(mut self, val: bool) -> Self {
        self.unit.use_hash = Some(val);
        self
    }

    pub fn build(self) -> UnitConfig {
        self.unit
    }
}

/// Write `contents` as `Multibuild.toml` in `dir`.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("Multibuild.toml");
    fs::write(&path, contents).expect("writing test config");
    path
}
