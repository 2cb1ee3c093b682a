// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::types::Parallelism;
use crate::watch::{DEFAULT_AGGREGATE_TIMEOUT, DEFAULT_IGNORED, WatchDefaults, WatchOptions};

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [group]
/// parallelism = 2
///
/// [watch]
/// aggregate_timeout_ms = 20
///
/// [default]
/// watch = ["src/**/*"]
///
/// [unit.lib]
/// cmd = "make lib"
///
/// [unit.app]
/// cmd = "make app"
/// dependencies = ["lib"]
/// ```
///
/// All sections are optional; an empty `[unit]` table is rejected by
/// validation.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub group: GroupSection,

    #[serde(default)]
    pub watch: WatchSection,

    /// Defaults for `watch`, `exclude`, `use_hash`.
    #[serde(default)]
    pub default: DefaultSection,

    /// All units from `[unit.<name>]`, keyed by unit name.
    #[serde(default)]
    pub unit: BTreeMap<String, UnitConfig>,
}

/// Validated configuration. Only obtainable through
/// `ConfigFile::try_from(RawConfigFile)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub group: GroupSection,
    pub watch: WatchSection,
    pub default: DefaultSection,
    pub unit: BTreeMap<String, UnitConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            group: raw.group,
            watch: raw.watch,
            default: raw.default,
            unit: raw.unit,
        }
    }

    /// Watch/exclude defaults shared by every unit.
    pub fn watch_defaults(&self) -> WatchDefaults {
        WatchDefaults {
            watch: self.default.watch.clone(),
            exclude: self.default.exclude.clone(),
        }
    }

    pub fn watch_options(&self) -> WatchOptions {
        self.watch.options()
    }

    /// `0` and an absent value both mean no limit.
    pub fn parallelism(&self) -> Parallelism {
        match self.group.parallelism {
            Some(0) | None => Parallelism::unbounded(),
            Some(n) => Parallelism::limited(n),
        }
    }
}

/// `[group]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GroupSection {
    /// Maximum number of units building at once. Unbounded when absent or 0.
    #[serde(default)]
    pub parallelism: Option<usize>,
}

/// `[watch]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WatchSection {
    /// Window in which raw file events are coalesced into one rebuild.
    #[serde(default)]
    pub aggregate_timeout_ms: Option<u64>,

    /// Paths never reported by the watcher. Replaces the built-in list.
    #[serde(default)]
    pub ignored: Option<Vec<String>>,
}

impl WatchSection {
    pub fn aggregate_timeout(&self) -> Duration {
        self.aggregate_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_AGGREGATE_TIMEOUT)
    }

    pub fn options(&self) -> WatchOptions {
        WatchOptions {
            aggregate_timeout: self.aggregate_timeout(),
            ignored: self
                .ignored
                .clone()
                .unwrap_or_else(|| DEFAULT_IGNORED.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// `[default]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultSection {
    /// Watch patterns for units that do not set their own.
    #[serde(default)]
    pub watch: Vec<String>,

    /// Exclude patterns added to every unit.
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub use_hash: Option<bool>,
}

/// `[unit.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    /// Shell command that builds the unit.
    pub cmd: String,

    /// Units that must finish before this one starts, and whose rebuilds
    /// restart it.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Unit-local watch patterns. If `None`, `default.watch` is used.
    #[serde(default)]
    pub watch: Option<Vec<String>>,

    /// Unit-local exclude patterns, added to `default.exclude`.
    #[serde(default)]
    pub exclude: Option<Vec<String>>,

    /// If true, `default.watch` is appended to `watch` instead of being
    /// replaced by it.
    #[serde(default)]
    pub append_default_watch: bool,

    /// Skip the command when the watched files are unchanged. Falls back to
    /// `default.use_hash`, then `false`.
    #[serde(default)]
    pub use_hash: Option<bool>,
}

impl UnitConfig {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            dependencies: Vec::new(),
            watch: None,
            exclude: None,
            append_default_watch: false,
            use_hash: None,
        }
    }

    pub fn effective_use_hash(&self, default_use_hash: Option<bool>) -> bool {
        self.use_hash.or(default_use_hash).unwrap_or(false)
    }
}
