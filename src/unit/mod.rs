// src/unit/mod.rs

//! Build unit abstraction.
//!
//! The orchestrator talks to a [`BuildUnit`] instead of a concrete compiler.
//! This keeps the scheduling logic independent of what a "build" actually is:
//!
//! - [`CommandUnit`] is the implementation used by the `multibuild` binary.
//!   It runs a shell command and reports the files it should be watched on.
//! - Tests provide their own `BuildUnit` that records which units were built
//!   and completes on demand.

pub mod command;
pub mod hash;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::types::{BoxFuture, PathSet, TimestampMap, UnitId};
use crate::watch::WatchFileSystem;

pub use command::CommandUnit;

/// Trait implemented by anything the orchestrator can build.
pub trait BuildUnit: Send + Sync + 'static {
    /// Stable name used for dependency references and logging.
    fn name(&self) -> Option<&str>;

    /// Names of units that must finish before this one may start.
    ///
    /// Can be overridden per group with `BuildGroup::set_dependencies`.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run one build.
    ///
    /// An `Err` is a hard failure that aborts the whole group. Problems in the
    /// built artifacts themselves belong in [`BuildOutput::errors`].
    fn build(&self, request: BuildRequest) -> BoxFuture<'_, anyhow::Result<BuildOutput>>;

    /// Release whatever the unit holds on to.
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// File system used to watch this unit's dependencies in watch mode.
    ///
    /// Units without one are built once and never re-subscribed.
    fn watch_file_system(&self) -> Option<Arc<dyn WatchFileSystem>>;
}

/// Whether a build was requested by `run` or by a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    #[default]
    Run,
    Watch,
}

/// Input handed to [`BuildUnit::build`].
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub mode: BuildMode,
    /// Files changed since the previous build, or `None` when unknown
    /// (first build, explicit invalidation without file information).
    pub modified_files: Option<PathSet>,
    /// Files removed since the previous build, same convention.
    pub removed_files: Option<PathSet>,
    pub file_timestamps: Option<TimestampMap>,
    pub context_timestamps: Option<TimestampMap>,
}

/// What a unit reports after a successful build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Files whose modification should trigger a rebuild.
    pub file_dependencies: PathSet,
    /// Directories watched recursively.
    pub context_dependencies: PathSet,
    /// Paths that did not exist but whose creation should trigger a rebuild.
    pub missing_dependencies: PathSet,
    /// Content hash of the build, if the unit computes one.
    pub hash: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Statistics wrapper around a finished build.
#[derive(Debug, Clone)]
pub struct BuildStats {
    pub unit: UnitId,
    pub name: Option<String>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    output: Arc<BuildOutput>,
}

impl BuildStats {
    pub fn new(
        unit: UnitId,
        name: Option<String>,
        start_time: SystemTime,
        end_time: SystemTime,
        output: BuildOutput,
    ) -> Self {
        Self {
            unit,
            name,
            start_time,
            end_time,
            output: Arc::new(output),
        }
    }

    pub fn output(&self) -> &BuildOutput {
        &self.output
    }

    pub fn hash(&self) -> Option<&str> {
        self.output.hash.as_deref()
    }

    pub fn has_errors(&self) -> bool {
        !self.output.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.output.warnings.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    /// Name if the unit has one, otherwise the positional id.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.unit.to_string(),
        }
    }
}
