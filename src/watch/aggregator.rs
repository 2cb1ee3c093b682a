// src/watch/aggregator.rs

use std::path::PathBuf;
use std::time::SystemTime;

use crate::types::TimestampMap;
use crate::watch::WatchDelivery;
use crate::watch::collected::ChangeSet;

/// Coalescing state of a native watch session.
///
/// Raw events are folded in with [`Aggregator::record`]; the first one after
/// a delivery opens a window, [`Aggregator::take`] closes it. Timestamps are
/// kept for the whole session so each delivery carries a full snapshot.
#[derive(Debug, Default)]
pub struct Aggregator {
    pending: ChangeSet,
    file_timestamps: TimestampMap,
    context_timestamps: TimestampMap,
    window_open: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one raw event. `mtime` is `None` when the path no longer exists.
    ///
    /// Returns `true` if this event opened a new aggregation window.
    pub fn record(
        &mut self,
        path: PathBuf,
        mtime: Option<SystemTime>,
        context: Option<PathBuf>,
        now: SystemTime,
    ) -> bool {
        match mtime {
            Some(_) => self.pending.record_change(path.clone()),
            None => self.pending.record_removal(path.clone()),
        }
        self.file_timestamps.insert(path, mtime);
        if let Some(dir) = context {
            self.context_timestamps.insert(dir, Some(now));
        }

        !std::mem::replace(&mut self.window_open, true)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hand out everything collected since the last delivery.
    pub fn take(&mut self) -> WatchDelivery {
        self.window_open = false;
        let (changes, removals) = std::mem::take(&mut self.pending).into_sets();
        WatchDelivery {
            changes,
            removals,
            file_timestamps: self.file_timestamps.clone(),
            context_timestamps: self.context_timestamps.clone(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_event_opens_a_window() {
        let mut agg = Aggregator::new();
        let now = SystemTime::now();

        assert!(agg.record("a".into(), Some(now), None, now));
        assert!(!agg.record("b".into(), Some(now), None, now));

        let delivery = agg.take();
        assert_eq!(delivery.changes.len(), 2);
        assert!(!agg.has_pending());

        assert!(agg.record("a".into(), None, Some("dir".into()), now));
        let delivery = agg.take();
        assert!(delivery.changes.is_empty());
        assert!(delivery.removals.contains(&PathBuf::from("a")));
        assert_eq!(delivery.file_timestamps.get(&PathBuf::from("a")), Some(&None));
        assert!(delivery.file_timestamps.contains_key(&PathBuf::from("b")));
        assert!(delivery.context_timestamps.contains_key(&PathBuf::from("dir")));
    }
}
