use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

/// Position of a build unit in its group (construction order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Set of paths, kept sorted so logs and tests are deterministic.
pub type PathSet = BTreeSet<PathBuf>;

/// Per-path timestamps reported by a watcher.
///
/// `None` marks a path that no longer exists.
pub type TimestampMap = BTreeMap<PathBuf, Option<SystemTime>>;

/// Boxed, sendable future used at the trait seams (build units, close).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Concurrency budget for a group.
///
/// `None` and `Some(0)` both mean "unbounded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Parallelism(Option<usize>);

impl Parallelism {
    pub fn unbounded() -> Self {
        Parallelism(None)
    }

    pub fn limited(n: usize) -> Self {
        Parallelism(Some(n))
    }

    /// Effective number of units allowed to build at once.
    pub fn limit(self) -> usize {
        match self.0 {
            Some(0) | None => usize::MAX,
            Some(n) => n,
        }
    }
}

impl From<Option<usize>> for Parallelism {
    fn from(value: Option<usize>) -> Self {
        Parallelism(value)
    }
}
