// src/watch/mock.rs

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use anyhow::{Result, anyhow};

use crate::types::PathSet;
use crate::watch::collected::ChangeSet;
use crate::watch::{
    WatchDelivery, WatchEvent, WatchFileSystem, WatchRequest, WatchSink, WatcherHandle,
};

/// In-memory [`WatchFileSystem`] driven by hand.
///
/// Every `watch` call is recorded. Tests push changes with
/// [`MockWatchFileSystem::emit_change`]; they are delivered to the most
/// recent subscription, or held back for `get_info` while it is paused.
#[derive(Clone, Default)]
pub struct MockWatchFileSystem {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    sessions: Vec<MockSession>,
    fail_next: Option<String>,
}

struct MockSession {
    request: WatchRequest,
    sink: WatchSink,
    paused: bool,
    closed: bool,
    held: ChangeSet,
}

impl MockState {
    fn current(&mut self) -> Option<&mut MockSession> {
        self.sessions.last_mut().filter(|s| !s.closed)
    }
}

impl fmt::Debug for MockWatchFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockWatchFileSystem")
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

impl MockWatchFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `watch` calls so far.
    pub fn watch_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Request of the most recent `watch` call.
    pub fn last_request(&self) -> Option<WatchRequest> {
        self.lock().sessions.last().map(|s| s.request.clone())
    }

    /// Whether the most recent subscription is live (not paused or closed).
    pub fn is_active(&self) -> bool {
        self.lock()
            .sessions
            .last()
            .map(|s| !s.paused && !s.closed)
            .unwrap_or(false)
    }

    /// Whether every subscription handed out so far has been closed.
    pub fn all_closed(&self) -> bool {
        self.lock().sessions.iter().all(|s| s.closed)
    }

    /// Make the next `watch` call fail with `message`.
    pub fn fail_next_watch(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// Report changed and removed files.
    ///
    /// A live subscription receives `Invalidated` for the first path
    /// followed by one `Aggregated` delivery. A paused one holds the
    /// changes for `get_info`. Returns `false` if there is no open
    /// subscription.
    pub fn emit_change<I, J>(&self, changed: I, removed: J) -> bool
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
        J: IntoIterator,
        J::Item: Into<PathBuf>,
    {
        let changed: PathSet = changed.into_iter().map(Into::into).collect();
        let removed: PathSet = removed.into_iter().map(Into::into).collect();
        let now = SystemTime::now();

        let sink = {
            let mut state = self.lock();
            let Some(session) = state.current() else {
                return false;
            };
            if session.paused {
                session.held.merge(&changed, &removed);
                return true;
            }
            Arc::clone(&session.sink)
        };

        let first = changed.iter().chain(removed.iter()).next().cloned();
        let delivery = WatchDelivery {
            file_timestamps: changed
                .iter()
                .map(|p| (p.clone(), Some(now)))
                .chain(removed.iter().map(|p| (p.clone(), None)))
                .collect(),
            changes: changed,
            removals: removed,
            context_timestamps: Default::default(),
        };

        sink(WatchEvent::Invalidated {
            path: first,
            time: now,
        });
        sink(WatchEvent::Aggregated(delivery));
        true
    }

    /// Shorthand for a single changed file.
    pub fn emit_file_change(&self, path: impl Into<PathBuf>) -> bool {
        let path: PathBuf = path.into();
        self.emit_change([path], Vec::<PathBuf>::new())
    }

    /// Report only the undelayed first-change notification.
    pub fn emit_invalidated(&self, path: impl Into<PathBuf>) -> bool {
        let sink = {
            let mut state = self.lock();
            match state.current() {
                Some(session) if !session.paused => Arc::clone(&session.sink),
                _ => return false,
            }
        };
        sink(WatchEvent::Invalidated {
            path: Some(path.into()),
            time: SystemTime::now(),
        });
        true
    }

    /// Report a failure of the watch mechanism.
    pub fn emit_error(&self, message: impl Into<String>) -> bool {
        let sink = {
            let mut state = self.lock();
            match state.current() {
                Some(session) => Arc::clone(&session.sink),
                None => return false,
            }
        };
        sink(WatchEvent::Failed(message.into()));
        true
    }
}

impl WatchFileSystem for MockWatchFileSystem {
    fn watch(&self, request: WatchRequest, sink: WatchSink) -> Result<Box<dyn WatcherHandle>> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(anyhow!(message));
        }

        // Changes held by the superseded subscription are delivered to the
        // new one, like a native watcher flushing its backlog.
        let held = state
            .sessions
            .last_mut()
            .map(|s| std::mem::take(&mut s.held))
            .unwrap_or_default();

        state.sessions.push(MockSession {
            request,
            sink,
            paused: false,
            closed: false,
            held: ChangeSet::new(),
        });
        let handle = Box::new(MockHandle {
            index: state.sessions.len() - 1,
            state: Arc::clone(&self.state),
        });
        drop(state);

        if !held.is_empty() {
            let (changed, removed) = held.into_sets();
            self.emit_change(changed, removed);
        }
        Ok(handle)
    }
}

struct MockHandle {
    index: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn with_session<T>(&self, f: impl FnOnce(&mut MockSession) -> T) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sessions.get_mut(self.index).map(f)
    }
}

impl WatcherHandle for MockHandle {
    fn pause(&mut self) {
        self.with_session(|s| s.paused = true);
    }

    fn close(&mut self) {
        self.with_session(|s| {
            s.closed = true;
            s.held = ChangeSet::new();
        });
    }

    fn get_info(&mut self) -> WatchDelivery {
        self.with_session(|s| {
            let (changes, removals) = std::mem::take(&mut s.held).into_sets();
            WatchDelivery {
                changes,
                removals,
                ..Default::default()
            }
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn recording_sink() -> (WatchSink, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink: WatchSink = Arc::new(move |event| {
            let _ = tx.lock().unwrap().send(event);
        });
        (sink, rx)
    }

    #[test]
    fn delivers_to_live_subscription() {
        let fs = MockWatchFileSystem::new();
        let (sink, rx) = recording_sink();
        let _handle = fs.watch(WatchRequest::default(), sink).unwrap();

        assert!(fs.emit_file_change("a.txt"));
        assert!(matches!(rx.recv().unwrap(), WatchEvent::Invalidated { .. }));
        match rx.recv().unwrap() {
            WatchEvent::Aggregated(d) => assert!(d.changes.contains(&PathBuf::from("a.txt"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn paused_subscription_holds_changes_for_get_info() {
        let fs = MockWatchFileSystem::new();
        let (sink, rx) = recording_sink();
        let mut handle = fs.watch(WatchRequest::default(), sink).unwrap();
        handle.pause();

        assert!(fs.emit_change(["a", "b"], ["c"]));
        assert!(rx.try_recv().is_err());

        let info = handle.get_info();
        assert_eq!(info.changes.len(), 2);
        assert!(info.removals.contains(&PathBuf::from("c")));
    }

    #[test]
    fn closed_subscription_ignores_changes() {
        let fs = MockWatchFileSystem::new();
        let (sink, _rx) = recording_sink();
        let mut handle = fs.watch(WatchRequest::default(), sink).unwrap();
        handle.close();

        assert!(!fs.emit_file_change("a"));
        assert!(fs.all_closed());
    }

    #[test]
    fn scripted_failure_applies_once() {
        let fs = MockWatchFileSystem::new();
        fs.fail_next_watch("no inotify");
        let (sink, _rx) = recording_sink();
        assert!(fs.watch(WatchRequest::default(), sink.clone()).is_err());
        assert!(fs.watch(WatchRequest::default(), sink).is_ok());
        assert_eq!(fs.watch_count(), 1);
    }
}
