// src/watch/mod.rs

//! File watching and change collection.
//!
//! This module is responsible for:
//! - The [`WatchFileSystem`] seam a watch controller subscribes through.
//! - A native implementation backed by `notify` ([`NotifyWatchFileSystem`]).
//! - A scriptable in-memory implementation for tests ([`MockWatchFileSystem`]).
//! - Compiling `watch` / `exclude` / `ignored` glob patterns.
//!
//! It does **not** know about units or dependencies; it only turns
//! filesystem changes into coalesced deliveries.

pub mod aggregator;
pub mod collected;
pub mod mock;
pub mod native;
pub mod patterns;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::types::{PathSet, TimestampMap};

pub use collected::ChangeSet;
pub use mock::MockWatchFileSystem;
pub use native::NotifyWatchFileSystem;
pub use patterns::{PatternSet, UnitPatterns, WatchDefaults};

/// Window used to coalesce bursts of raw events into one delivery.
pub const DEFAULT_AGGREGATE_TIMEOUT: Duration = Duration::from_millis(5);

/// Paths never worth watching.
pub const DEFAULT_IGNORED: &[&str] = &["**/.git/**", "**/node_modules/**"];

/// Per-session watcher options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub aggregate_timeout: Duration,
    /// Glob patterns; matching paths are never reported.
    pub ignored: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            aggregate_timeout: DEFAULT_AGGREGATE_TIMEOUT,
            ignored: DEFAULT_IGNORED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// What to watch after a build.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub files: PathSet,
    /// Directories watched recursively.
    pub dirs: PathSet,
    /// Paths that do not exist yet; their creation counts as a change.
    pub missing: PathSet,
    /// Files modified after this instant are reported right away.
    pub start_time: Option<SystemTime>,
    pub options: WatchOptions,
}

/// Coalesced result of one aggregation window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchDelivery {
    pub changes: PathSet,
    pub removals: PathSet,
    pub file_timestamps: TimestampMap,
    pub context_timestamps: TimestampMap,
}

impl WatchDelivery {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.removals.is_empty()
    }
}

/// Notifications a watcher hands to its subscriber.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// First raw change of an aggregation window, undelayed.
    Invalidated {
        path: Option<PathBuf>,
        time: SystemTime,
    },
    /// End of an aggregation window.
    Aggregated(WatchDelivery),
    /// The watch mechanism itself broke.
    Failed(String),
}

/// Callback receiving watcher notifications. Called from arbitrary threads.
pub type WatchSink = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Something that can watch paths on behalf of one build unit.
pub trait WatchFileSystem: Send + Sync {
    /// Start or update a watch session.
    ///
    /// A new call supersedes the handle returned by the previous one.
    fn watch(
        &self,
        request: WatchRequest,
        sink: WatchSink,
    ) -> anyhow::Result<Box<dyn WatcherHandle>>;
}

/// Handle to one watch subscription.
pub trait WatcherHandle: Send {
    /// Stop delivering, keep watching and accumulating.
    fn pause(&mut self);

    /// Tear the subscription down. No-op for a superseded handle.
    fn close(&mut self);

    /// Take the accumulated, undelivered changes.
    fn get_info(&mut self) -> WatchDelivery;
}

impl fmt::Debug for dyn WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatcherHandle")
    }
}

impl fmt::Debug for dyn WatchFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatchFileSystem")
    }
}
