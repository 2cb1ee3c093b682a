// src/watch/native.rs

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::types::PathSet;
use crate::watch::aggregator::Aggregator;
use crate::watch::patterns::PatternSet;
use crate::watch::{
    DEFAULT_AGGREGATE_TIMEOUT, WatchDelivery, WatchEvent, WatchFileSystem, WatchRequest,
    WatchSink, WatcherHandle,
};

/// [`WatchFileSystem`] backed by the platform's native watcher (`notify`).
///
/// One OS watcher is kept per instance. Each `watch` call only applies the
/// difference between the previously and newly requested paths, so
/// re-subscribing after every build is cheap. Give every unit its own
/// instance.
#[derive(Clone, Default)]
pub struct NotifyWatchFileSystem {
    session: Arc<Mutex<Session>>,
}

impl fmt::Debug for NotifyWatchFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = lock(&self.session);
        f.debug_struct("NotifyWatchFileSystem")
            .field("generation", &session.generation)
            .field("roots", &session.roots.len())
            .finish()
    }
}

impl NotifyWatchFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Listener {
    sink: WatchSink,
    paused: bool,
}

#[derive(Default)]
struct Session {
    watcher: Option<RecommendedWatcher>,
    /// OS-level watch roots, `true` for recursive.
    roots: BTreeMap<PathBuf, bool>,
    files: PathSet,
    dirs: PathSet,
    missing: PathSet,
    generation: u64,
    listener: Option<Listener>,
    aggregator: Aggregator,
    timer_armed: bool,
    aggregate_timeout: Duration,
    ignored: Option<PatternSet>,
    runtime: Option<Handle>,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatchFileSystem for NotifyWatchFileSystem {
    fn watch(&self, request: WatchRequest, sink: WatchSink) -> Result<Box<dyn WatcherHandle>> {
        let runtime =
            Handle::try_current().context("the native watcher needs a running Tokio runtime")?;
        let ignored = PatternSet::new(&request.options.ignored).context("compiling ignored patterns")?;

        let mut session = lock(&self.session);

        if session.watcher.is_none() {
            let weak = Arc::downgrade(&self.session);
            let watcher = RecommendedWatcher::new(
                move |res: notify::Result<Event>| on_notify(&weak, res),
                Config::default(),
            )
            .context("creating native file watcher")?;
            session.watcher = Some(watcher);
        }

        session.generation += 1;
        session.runtime = Some(runtime);
        session.ignored = Some(ignored);
        session.aggregate_timeout = if request.options.aggregate_timeout.is_zero() {
            DEFAULT_AGGREGATE_TIMEOUT
        } else {
            request.options.aggregate_timeout
        };

        let roots = watch_roots(&request);
        session.apply_roots(roots)?;

        let WatchRequest {
            files,
            dirs,
            missing,
            start_time,
            ..
        } = request;
        session.files = files;
        session.dirs = dirs;
        session.missing = missing;
        session.listener = Some(Listener {
            sink,
            paused: false,
        });

        if let Some(start) = start_time {
            session.seed_changed_since(start);
        }
        if session.aggregator.has_pending() && !session.timer_armed {
            session.arm_timer(&self.session);
        }

        debug!(
            generation = session.generation,
            roots = session.roots.len(),
            files = session.files.len(),
            dirs = session.dirs.len(),
            "native watcher subscribed"
        );

        Ok(Box::new(NativeHandle {
            generation: session.generation,
            session: Arc::clone(&self.session),
        }))
    }
}

impl Session {
    /// Bring the OS watches in line with `desired`, touching only what changed.
    fn apply_roots(&mut self, desired: BTreeMap<PathBuf, bool>) -> Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(());
        };

        for (path, recursive) in &self.roots {
            if desired.get(path) != Some(recursive) {
                if let Err(err) = watcher.unwatch(path) {
                    trace!(path = ?path, error = %err, "unwatch failed");
                }
            }
        }

        for (path, recursive) in &desired {
            if self.roots.get(path) != Some(recursive) {
                let mode = if *recursive {
                    RecursiveMode::Recursive
                } else {
                    RecursiveMode::NonRecursive
                };
                watcher
                    .watch(path, mode)
                    .with_context(|| format!("watching {path:?}"))?;
            }
        }

        self.roots = desired;
        Ok(())
    }

    /// Report files touched after `start` as if they had just changed.
    ///
    /// Paths that do not exist are left alone: their later creation is seen
    /// by the OS watcher.
    fn seed_changed_since(&mut self, start: SystemTime) {
        let now = SystemTime::now();
        let files: Vec<PathBuf> = self.files.iter().cloned().collect();
        for file in files {
            if let Ok(mtime) = fs::metadata(&file).and_then(|m| m.modified()) {
                if mtime > start {
                    self.aggregator.record(file, Some(mtime), None, now);
                }
            }
        }
    }

    /// Decide whether a raw event path is interesting.
    ///
    /// Returns `None` to drop it, `Some(context)` to record it, where
    /// `context` is the watched directory containing it, if any.
    fn classify(&self, path: &Path) -> Option<Option<PathBuf>> {
        if let Some(ignored) = &self.ignored {
            if ignored.is_match(path) {
                return None;
            }
        }
        if self.files.contains(path) || self.missing.contains(path) {
            return Some(None);
        }
        self.dirs
            .iter()
            .find(|dir| path.starts_with(dir))
            .map(|dir| Some(dir.clone()))
    }

    fn active_sink(&self) -> Option<WatchSink> {
        self.listener
            .as_ref()
            .filter(|l| !l.paused)
            .map(|l| Arc::clone(&l.sink))
    }

    fn arm_timer(&mut self, session: &Arc<Mutex<Session>>) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        self.timer_armed = true;
        let weak = Arc::downgrade(session);
        let delay = self.aggregate_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            flush(&weak);
        });
    }

    fn teardown(&mut self) -> Option<RecommendedWatcher> {
        self.listener = None;
        self.roots.clear();
        self.files.clear();
        self.dirs.clear();
        self.missing.clear();
        self.aggregator.clear();
        self.watcher.take()
    }
}

/// Directories handed to the OS watcher for a request.
///
/// Files and missing paths are watched through their closest existing
/// ancestor, non-recursively; directories recursively.
fn watch_roots(request: &WatchRequest) -> BTreeMap<PathBuf, bool> {
    let mut roots = BTreeMap::new();
    for dir in &request.dirs {
        if dir.is_dir() {
            roots.insert(dir.clone(), true);
        } else if let Some(parent) = existing_ancestor(dir) {
            roots.entry(parent).or_insert(false);
        }
    }
    for path in request.files.iter().chain(request.missing.iter()) {
        if let Some(parent) = existing_ancestor(path) {
            roots.entry(parent).or_insert(false);
        }
    }
    roots
}

fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|p| !p.as_os_str().is_empty() && p.is_dir())
        .map(Path::to_path_buf)
}

/// Runs on notify's thread.
fn on_notify(session: &Weak<Mutex<Session>>, res: notify::Result<Event>) {
    let Some(session) = session.upgrade() else {
        return;
    };

    let mut notifications: Vec<(WatchSink, WatchEvent)> = Vec::new();
    {
        let mut s = lock(&session);
        match res {
            Err(err) => {
                warn!(error = %err, "native watcher error");
                if let Some(sink) = s.active_sink() {
                    notifications.push((sink, WatchEvent::Failed(err.to_string())));
                }
            }
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let now = SystemTime::now();
                for path in event.paths {
                    let Some(context) = s.classify(&path) else {
                        continue;
                    };
                    let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
                    trace!(path = ?path, removed = mtime.is_none(), "raw change");
                    let opened = s.aggregator.record(path.clone(), mtime, context, now);
                    if opened {
                        if let Some(sink) = s.active_sink() {
                            notifications.push((
                                sink,
                                WatchEvent::Invalidated {
                                    path: Some(path),
                                    time: now,
                                },
                            ));
                        }
                    }
                }
                if s.aggregator.has_pending() && !s.timer_armed {
                    s.arm_timer(&session);
                }
            }
        }
    }

    for (sink, event) in notifications {
        sink(event);
    }
}

/// End of an aggregation window. A paused listener keeps accumulating.
fn flush(session: &Weak<Mutex<Session>>) {
    let Some(session) = session.upgrade() else {
        return;
    };
    let delivery = {
        let mut s = lock(&session);
        s.timer_armed = false;
        match s.active_sink() {
            Some(sink) if s.aggregator.has_pending() => Some((sink, s.aggregator.take())),
            _ => None,
        }
    };
    if let Some((sink, delivery)) = delivery {
        debug!(
            changes = delivery.changes.len(),
            removals = delivery.removals.len(),
            "native watcher delivering aggregated changes"
        );
        sink(WatchEvent::Aggregated(delivery));
    }
}

struct NativeHandle {
    generation: u64,
    session: Arc<Mutex<Session>>,
}

impl NativeHandle {
    fn with_current<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let mut session = lock(&self.session);
        if session.generation == self.generation {
            Some(f(&mut *session))
        } else {
            None
        }
    }
}

impl WatcherHandle for NativeHandle {
    fn pause(&mut self) {
        self.with_current(|s| {
            if let Some(listener) = s.listener.as_mut() {
                listener.paused = true;
            }
        });
    }

    fn close(&mut self) {
        // Drop the OS watcher outside the lock; its thread may be waiting on it.
        let watcher = self.with_current(Session::teardown).flatten();
        if watcher.is_some() {
            debug!(generation = self.generation, "native watcher closed");
        }
        drop(watcher);
    }

    fn get_info(&mut self) -> WatchDelivery {
        self.with_current(|s| s.aggregator.take())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use tokio::sync::mpsc;

    use super::*;
    use crate::watch::WatchOptions;

    fn channel_sink() -> (WatchSink, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: WatchSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    async fn next_aggregated(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchDelivery {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for watcher")
                .expect("sink dropped");
            if let WatchEvent::Aggregated(delivery) = event {
                return delivery;
            }
        }
    }

    fn request_for(file: &Path, start_time: Option<SystemTime>) -> WatchRequest {
        WatchRequest {
            files: [file.to_path_buf()].into_iter().collect(),
            start_time,
            options: WatchOptions::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn files_newer_than_start_time_are_reported_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        fs::write(&file, "v1").unwrap();

        let fs = NotifyWatchFileSystem::new();
        let (sink, mut rx) = channel_sink();
        let _handle = fs.watch(request_for(&file, Some(UNIX_EPOCH)), sink).unwrap();

        let delivery = next_aggregated(&mut rx).await;
        assert!(delivery.changes.contains(&file));
        assert!(matches!(delivery.file_timestamps.get(&file), Some(Some(_))));
    }

    #[tokio::test]
    async fn missing_files_are_not_reported_on_resubscription() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("never-existed.txt");

        let fs = NotifyWatchFileSystem::new();
        let (sink, mut rx) = channel_sink();
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(
                fs.watch(request_for(&file, Some(SystemTime::now())), sink.clone())
                    .unwrap(),
            );
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, WatchEvent::Aggregated(_)),
                "unexpected delivery: {event:?}"
            );
        }
        assert!(handles.last_mut().unwrap().get_info().is_empty());
    }

    #[tokio::test]
    async fn paused_handle_accumulates_for_get_info() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        fs::write(&file, "v1").unwrap();

        let fs = NotifyWatchFileSystem::new();
        let (sink, mut rx) = channel_sink();
        let mut handle = fs.watch(request_for(&file, Some(UNIX_EPOCH)), sink).unwrap();
        handle.pause();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "paused watcher must not deliver");

        let info = handle.get_info();
        assert!(info.changes.contains(&file));
        assert!(handle.get_info().changes.is_empty());
    }

    #[tokio::test]
    async fn superseded_handle_close_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        fs::write(&file, "v1").unwrap();

        let fs = NotifyWatchFileSystem::new();
        let (first_sink, _first_rx) = channel_sink();
        let mut first = fs.watch(request_for(&file, None), first_sink).unwrap();

        let (sink, mut rx) = channel_sink();
        let _second = fs.watch(request_for(&file, Some(UNIX_EPOCH)), sink).unwrap();
        first.close();

        let delivery = next_aggregated(&mut rx).await;
        assert!(delivery.changes.contains(&file));
    }

    #[tokio::test]
    async fn reports_modifications_of_watched_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        fs::write(&file, "v1").unwrap();
        let file = file.canonicalize().unwrap();

        let fs = NotifyWatchFileSystem::new();
        let (sink, mut rx) = channel_sink();
        let _handle = fs.watch(request_for(&file, None), sink).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&file, "v2").unwrap();

        let delivery = next_aggregated(&mut rx).await;
        assert!(delivery.changes.contains(&file));
    }
}
