// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the orchestrator.
///
/// The enum is `Clone` because one failure is frequently delivered to several
/// waiters at once (the group handler plus every pending `invalidate` caller).
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0}")]
    InvalidDependencies(DependencyReport),

    #[error(
        "You ran a build while a previous build was still running. \
         Concurrent builds on the same group are not supported."
    )]
    ConcurrentCompilation,

    #[error("Build of `{unit}` failed: {message}")]
    BuildFailed { unit: String, message: String },

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Teardown of `{unit}` failed: {message}")]
    Teardown { unit: String, message: String },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("TOML parsing error: {0}")]
    Toml(String),

    #[error("orchestrator is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        OrchestratorError::Toml(err.to_string())
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Other(format!("{err:#}"))
    }
}

/// Everything wrong with a declared dependency relation, reported at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    /// Dependency names that do not match any unit.
    pub missing: Vec<String>,
    /// Edges (`dependent`, `dependency`) left over after removing everything
    /// reachable from the units nobody depends on. Sorted.
    pub cycle: Vec<(String, String)>,
}

impl DependencyReport {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.cycle.is_empty()
    }
}

impl fmt::Display for DependencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();
        if !self.cycle.is_empty() {
            lines.push("Circular dependency found in unit dependencies.".to_string());
            for (source, target) in &self.cycle {
                lines.push(format!("{source} -> {target}"));
            }
        }
        for name in &self.missing {
            lines.push(format!("Unit dependency `{name}` not found."));
        }
        write!(f, "{}", lines.join("\n"))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, OrchestratorError>;
