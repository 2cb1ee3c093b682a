// src/engine/controller.rs

//! Build/rebuild cycle of a single unit in watch mode.
//!
//! A [`WatchController`] is a synchronous state machine owned by the runtime
//! actor. It never awaits anything: every decision it takes is recorded as a
//! [`ControllerEffect`] that the core drains with
//! [`WatchController::take_effects`] and turns into commands for the shell.
//! Builds, watcher deliveries and caller requests come back in through the
//! `on_*` methods and [`WatchController::invalidate`].

use std::mem;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::dag::hooks::NodeHooks;
use crate::engine::{Ack, LifecycleEvent, RuntimeEvent};
use crate::errors::{OrchestratorError, Result};
use crate::types::{TimestampMap, UnitId};
use crate::unit::{BuildMode, BuildOutput, BuildRequest, BuildStats};
use crate::watch::collected::ChangeSet;
use crate::watch::{
    WatchDelivery, WatchEvent, WatchFileSystem, WatchOptions, WatchRequest, WatchSink,
    WatcherHandle,
};

/// Something the controller decided and the engine must carry out.
#[derive(Debug)]
pub enum ControllerEffect {
    /// Run the unit's build with this request.
    StartBuild(BuildRequest),
    /// Result for whoever schedules the unit.
    Report(Result<BuildStats>),
    Lifecycle(LifecycleEvent),
    /// The watch session was torn down.
    Closed(Result<()>),
}

/// Per-unit watch session.
pub struct WatchController {
    unit: UnitId,
    name: Option<String>,
    label: String,
    fs: Option<Arc<dyn WatchFileSystem>>,
    options: WatchOptions,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    hooks: Box<dyn NodeHooks>,

    watcher: Option<Box<dyn WatcherHandle>>,
    paused_watcher: Option<Box<dyn WatcherHandle>>,
    /// Generation of `watcher`; bumped by every subscription.
    generation: u64,
    paused_generation: Option<u64>,

    collected: Option<ChangeSet>,
    file_timestamps: Option<TimestampMap>,
    context_timestamps: Option<TimestampMap>,
    last_watcher_start: Option<SystemTime>,
    start_time: Option<SystemTime>,

    callbacks: Vec<Ack>,
    close_callbacks: Option<Vec<Ack>>,

    running: bool,
    invalid: bool,
    blocked: bool,
    suspended: bool,
    invalid_reported: bool,
    initial: bool,
    closed: bool,
    teardown_pending: bool,

    effects: Vec<ControllerEffect>,
}

impl std::fmt::Debug for WatchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchController")
            .field("unit", &self.label)
            .field("running", &self.running)
            .field("invalid", &self.invalid)
            .field("blocked", &self.blocked)
            .field("suspended", &self.suspended)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl WatchController {
    /// Create a controller. Nothing happens until the runtime delivers the
    /// initial tick ([`WatchController::initial_tick`]).
    pub fn new(
        unit: UnitId,
        name: Option<String>,
        fs: Option<Arc<dyn WatchFileSystem>>,
        options: WatchOptions,
        events: mpsc::UnboundedSender<RuntimeEvent>,
        hooks: Box<dyn NodeHooks>,
    ) -> Self {
        let label = name.clone().unwrap_or_else(|| unit.to_string());
        Self {
            unit,
            name,
            label,
            fs,
            options,
            events,
            hooks,
            watcher: None,
            paused_watcher: None,
            generation: 0,
            paused_generation: None,
            collected: None,
            file_timestamps: None,
            context_timestamps: None,
            last_watcher_start: None,
            start_time: None,
            callbacks: Vec::new(),
            close_callbacks: None,
            running: false,
            invalid: false,
            blocked: false,
            suspended: false,
            invalid_reported: true,
            initial: true,
            closed: false,
            teardown_pending: false,
            effects: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drain the decisions taken since the last call.
    pub fn take_effects(&mut self) -> Vec<ControllerEffect> {
        mem::take(&mut self.effects)
    }

    /// Deferred first invalidation; a no-op once anything has started a build.
    pub fn initial_tick(&mut self) {
        if self.initial && !self.closed {
            self.invalidate_internal(None);
        }
    }

    /// Request a rebuild. `ack` resolves when the rebuild has been reported.
    pub fn invalidate(&mut self, ack: Option<Ack>) {
        if self.closed {
            if let Some(ack) = ack {
                let _ = ack.send(Err(OrchestratorError::Closed));
            }
            return;
        }
        if let Some(ack) = ack {
            self.callbacks.push(ack);
        }
        if !self.invalid_reported {
            self.invalid_reported = true;
            self.effects.push(ControllerEffect::Lifecycle(LifecycleEvent::Invalid {
                unit: self.unit,
                path: None,
                time: SystemTime::now(),
            }));
        }
        self.hooks.on_change();
        self.invalidate_internal(None);
    }

    /// Stop building; changes are still collected.
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        if self.suspended {
            self.suspended = false;
            self.invalidate_internal(None);
        }
    }

    /// A watcher subscription created with `generation` reported `event`.
    pub fn on_watch_event(&mut self, generation: u64, event: WatchEvent) {
        if self.closed || !self.is_live_generation(generation) {
            trace!(unit = %self.label, generation, "ignoring stale watcher event");
            return;
        }

        match event {
            WatchEvent::Invalidated { path, time } => {
                if !self.invalid_reported {
                    self.invalid_reported = true;
                    self.effects.push(ControllerEffect::Lifecycle(LifecycleEvent::Invalid {
                        unit: self.unit,
                        path,
                        time,
                    }));
                }
                self.hooks.on_invalid();
            }
            WatchEvent::Aggregated(delivery) => {
                debug!(
                    unit = %self.label,
                    changes = delivery.changes.len(),
                    removals = delivery.removals.len(),
                    "watched files changed"
                );
                self.invalidate_internal(Some(delivery));
                self.hooks.on_change();
            }
            WatchEvent::Failed(message) => self.on_watcher_failed(message),
        }
    }

    /// The build started by the last `StartBuild` effect returned.
    pub fn on_build_finished(&mut self, result: anyhow::Result<BuildOutput>, finished: SystemTime) {
        self.running = false;

        if self.teardown_pending {
            self.teardown_pending = false;
            let result = result.map(|_| ()).map_err(|err| self.build_error(&err));
            self.teardown(result);
            return;
        }

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let err = self.build_error(&err);
                warn!(unit = %self.label, error = %err, "build failed");
                self.handle_error(err);
                return;
            }
        };

        let stats = BuildStats::new(
            self.unit,
            self.name.clone(),
            self.start_time.unwrap_or(finished),
            finished,
            output,
        );

        if self.invalid && !self.suspended && !self.blocked {
            if self.check_blocked() {
                self.blocked = true;
            } else {
                debug!(unit = %self.label, "invalidated while building; rebuilding");
                self.go(false);
                return;
            }
        }

        self.start_time = None;
        let callbacks = mem::take(&mut self.callbacks);

        info!(
            unit = %self.label,
            duration_ms = stats.duration().as_millis() as u64,
            errors = stats.output().errors.len(),
            "build done"
        );
        self.effects.push(ControllerEffect::Lifecycle(LifecycleEvent::Done {
            unit: self.unit,
            stats: stats.clone(),
        }));
        self.effects.push(ControllerEffect::Report(Ok(stats.clone())));

        if !self.closed {
            self.subscribe(stats.output());
        }
        for cb in callbacks {
            let _ = cb.send(Ok(()));
        }
    }

    /// Close the session. A running build is not aborted: teardown waits for
    /// it and its result is dropped. Concurrent closes share one teardown.
    pub fn close(&mut self, ack: Option<Ack>) {
        if let Some(pending) = self.close_callbacks.as_mut() {
            pending.extend(ack);
            return;
        }
        if self.closed {
            // Already torn down.
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            self.effects.push(ControllerEffect::Closed(Ok(())));
            return;
        }

        self.closed = true;
        if let Some(mut watcher) = self.watcher.take() {
            watcher.close();
        }
        if let Some(mut paused) = self.paused_watcher.take() {
            paused.close();
        }
        self.paused_generation = None;
        self.close_callbacks = Some(ack.into_iter().collect());

        if self.running {
            debug!(unit = %self.label, "close requested during build; deferring teardown");
            self.invalid = true;
            self.teardown_pending = true;
        } else {
            self.teardown(Ok(()));
        }
    }

    fn teardown(&mut self, result: Result<()>) {
        self.running = false;
        self.collected = None;
        self.file_timestamps = None;
        self.context_timestamps = None;

        for cb in mem::take(&mut self.callbacks) {
            let _ = cb.send(Err(OrchestratorError::Closed));
        }

        info!(unit = %self.label, "watch session closed");
        self.effects
            .push(ControllerEffect::Lifecycle(LifecycleEvent::WatchClosed { unit: self.unit }));

        for cb in self.close_callbacks.take().unwrap_or_default() {
            let _ = cb.send(result.clone());
        }
        self.effects.push(ControllerEffect::Closed(result));
    }

    fn invalidate_internal(&mut self, delivery: Option<WatchDelivery>) {
        let delivered = delivery.is_some();
        if let Some(delivery) = delivery {
            self.merge_with_collected(&delivery);
            self.file_timestamps = Some(delivery.file_timestamps);
            self.context_timestamps = Some(delivery.context_timestamps);
        }
        if self.suspended {
            return;
        }
        if self.check_blocked() {
            self.blocked = true;
            return;
        }
        if self.running {
            self.invalid = true;
            return;
        }
        self.go(delivered);
    }

    /// Start a build. `delivered` is set when the triggering watcher delivery
    /// has already been merged.
    fn go(&mut self, delivered: bool) {
        let now = SystemTime::now();
        self.initial = false;
        self.blocked = false;
        self.start_time.get_or_insert(now);
        self.running = true;

        if let Some(mut watcher) = self.watcher.take() {
            watcher.pause();
            self.paused_watcher = Some(watcher);
            self.paused_generation = Some(self.generation);
            self.last_watcher_start = Some(now);
        } else if self.last_watcher_start.is_none() {
            self.last_watcher_start = Some(now);
        }

        if !delivered {
            if let Some(info) = self.paused_watcher.as_mut().map(|w| w.get_info()) {
                self.merge_with_collected(&info);
                self.file_timestamps
                    .get_or_insert_with(TimestampMap::new)
                    .extend(info.file_timestamps);
                self.context_timestamps
                    .get_or_insert_with(TimestampMap::new)
                    .extend(info.context_timestamps);
            }
        }

        let (modified_files, removed_files) = match self.collected.take() {
            Some(collected) => {
                let (changed, removed) = collected.into_sets();
                (Some(changed), Some(removed))
            }
            None => (None, None),
        };
        self.invalid = false;
        self.invalid_reported = false;

        debug!(
            unit = %self.label,
            modified = modified_files.as_ref().map(|s| s.len()),
            removed = removed_files.as_ref().map(|s| s.len()),
            "starting watch build"
        );
        self.effects.push(ControllerEffect::Lifecycle(LifecycleEvent::WatchRunStarted {
            unit: self.unit,
        }));
        self.effects.push(ControllerEffect::StartBuild(BuildRequest {
            mode: BuildMode::Watch,
            modified_files,
            removed_files,
            file_timestamps: self.file_timestamps.clone(),
            context_timestamps: self.context_timestamps.clone(),
        }));
    }

    fn handle_error(&mut self, err: OrchestratorError) {
        self.effects.push(ControllerEffect::Lifecycle(LifecycleEvent::Failed {
            unit: self.unit,
            error: err.clone(),
        }));
        self.effects.push(ControllerEffect::Report(Err(err.clone())));
        for cb in mem::take(&mut self.callbacks) {
            let _ = cb.send(Err(err.clone()));
        }
    }

    fn on_watcher_failed(&mut self, message: String) {
        warn!(unit = %self.label, error = %message, "watcher failed");
        self.file_timestamps = None;
        self.context_timestamps = None;
        self.effects
            .push(ControllerEffect::Report(Err(OrchestratorError::Watcher(message))));
    }

    /// Subscribe to the dependencies of the last build.
    fn subscribe(&mut self, output: &BuildOutput) {
        let Some(fs) = self.fs.clone() else {
            self.paused_watcher = None;
            self.paused_generation = None;
            return;
        };

        self.generation += 1;
        let request = WatchRequest {
            files: output.file_dependencies.clone(),
            dirs: output.context_dependencies.clone(),
            missing: output.missing_dependencies.clone(),
            start_time: self.last_watcher_start,
            options: self.options.clone(),
        };

        let result = fs.watch(request, self.sink(self.generation));

        // The superseded subscription is closed only after the new one
        // exists, so a shared native session is kept alive.
        if let Some(mut paused) = self.paused_watcher.take() {
            paused.close();
        }
        self.paused_generation = None;

        match result {
            Ok(handle) => {
                trace!(unit = %self.label, generation = self.generation, "watching dependencies");
                self.watcher = Some(handle);
            }
            Err(err) => self.on_watcher_failed(format!("{err:#}")),
        }
    }

    fn sink(&self, generation: u64) -> WatchSink {
        let events = self.events.clone();
        let unit = self.unit;
        Arc::new(move |event| {
            let _ = events.send(RuntimeEvent::Watcher {
                unit,
                generation,
                event,
            });
        })
    }

    fn is_live_generation(&self, generation: u64) -> bool {
        (self.watcher.is_some() && generation == self.generation)
            || self.paused_generation == Some(generation)
    }

    fn merge_with_collected(&mut self, delivery: &WatchDelivery) {
        self.collected
            .get_or_insert_with(ChangeSet::new)
            .merge(&delivery.changes, &delivery.removals);
    }

    fn check_blocked(&self) -> bool {
        self.hooks.is_blocked()
    }

    fn build_error(&self, err: &anyhow::Error) -> OrchestratorError {
        OrchestratorError::BuildFailed {
            unit: self.label.clone(),
            message: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::oneshot;

    use super::*;
    use crate::dag::hooks::NoopHooks;
    use crate::watch::MockWatchFileSystem;

    struct Harness {
        controller: WatchController,
        fs: MockWatchFileSystem,
        events: mpsc::UnboundedReceiver<RuntimeEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let fs = MockWatchFileSystem::new();
            let (tx, events) = mpsc::unbounded_channel();
            let controller = WatchController::new(
                UnitId(0),
                Some("app".into()),
                Some(Arc::new(fs.clone())),
                WatchOptions::default(),
                tx,
                Box::new(NoopHooks),
            );
            Self {
                controller,
                fs,
                events,
            }
        }

        fn builds_started(&mut self) -> Vec<BuildRequest> {
            self.controller
                .take_effects()
                .into_iter()
                .filter_map(|e| match e {
                    ControllerEffect::StartBuild(r) => Some(r),
                    _ => None,
                })
                .collect()
        }

        fn finish(&mut self, output: BuildOutput) {
            self.controller.on_build_finished(Ok(output), SystemTime::now());
        }

        /// Feed every pending watcher notification back into the controller.
        fn pump_watcher(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                if let RuntimeEvent::Watcher {
                    generation, event, ..
                } = event
                {
                    self.controller.on_watch_event(generation, event);
                }
            }
        }
    }

    fn output_with(file: &str) -> BuildOutput {
        BuildOutput {
            file_dependencies: [PathBuf::from(file)].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn initial_tick_starts_first_build_without_file_info() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        let builds = h.builds_started();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].mode, BuildMode::Watch);
        assert!(builds[0].modified_files.is_none());

        // A second tick is a no-op.
        h.controller.initial_tick();
        assert!(h.builds_started().is_empty());
    }

    #[test]
    fn success_reports_and_subscribes_to_dependencies() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();
        h.finish(output_with("src/a.txt"));

        let effects = h.controller.take_effects();
        assert!(effects.iter().any(|e| matches!(e, ControllerEffect::Report(Ok(_)))));
        assert_eq!(h.fs.watch_count(), 1);
        let request = h.fs.last_request().unwrap();
        assert!(request.files.contains(&PathBuf::from("src/a.txt")));
        assert!(request.start_time.is_some());
    }

    #[test]
    fn change_triggers_rebuild_with_modified_files() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();
        h.finish(output_with("src/a.txt"));
        h.controller.take_effects();

        h.fs.emit_file_change("src/a.txt");
        h.pump_watcher();

        let effects = h.controller.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            ControllerEffect::Lifecycle(LifecycleEvent::Invalid { path: Some(_), .. })
        )));
        let build = effects
            .into_iter()
            .find_map(|e| match e {
                ControllerEffect::StartBuild(r) => Some(r),
                _ => None,
            })
            .expect("rebuild started");
        assert_eq!(
            build.modified_files,
            Some([PathBuf::from("src/a.txt")].into_iter().collect())
        );
        assert!(!h.fs.is_active(), "watcher is paused during the build");
    }

    #[test]
    fn invalidations_while_running_coalesce_into_one_rebuild() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        assert_eq!(h.builds_started().len(), 1);

        h.controller.invalidate(None);
        h.controller.invalidate(None);
        h.controller.invalidate(None);
        assert!(h.builds_started().is_empty());

        // First build completes: the pending invalidation restarts it
        // without reporting.
        h.finish(BuildOutput::default());
        let effects = h.controller.take_effects();
        assert!(!effects.iter().any(|e| matches!(e, ControllerEffect::Report(_))));
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, ControllerEffect::StartBuild(_)))
                .count(),
            1
        );

        h.finish(BuildOutput::default());
        let effects = h.controller.take_effects();
        assert!(effects.iter().any(|e| matches!(e, ControllerEffect::Report(Ok(_)))));
        assert!(!effects.iter().any(|e| matches!(e, ControllerEffect::StartBuild(_))));
    }

    #[test]
    fn failure_is_reported_to_pending_invalidate_callers() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();

        let (tx, mut rx) = oneshot::channel();
        h.controller.invalidate(Some(tx));
        // Running: the ack waits for the follow-up build.
        h.finish(BuildOutput::default());
        h.builds_started();
        h.controller
            .on_build_finished(Err(anyhow::anyhow!("compile error")), SystemTime::now());

        match rx.try_recv() {
            Ok(Err(OrchestratorError::BuildFailed { unit, message })) => {
                assert_eq!(unit, "app");
                assert!(message.contains("compile error"));
            }
            other => panic!("unexpected ack {other:?}"),
        }
        // The coalesced rebuild never subscribed, and failure does not either.
        assert_eq!(h.fs.watch_count(), 0);
    }

    #[test]
    fn suspended_controller_collects_without_building() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();
        h.finish(output_with("a"));
        h.controller.take_effects();

        h.controller.suspend();
        h.fs.emit_change(["a"], Vec::<PathBuf>::new());
        h.pump_watcher();
        assert!(h.builds_started().is_empty());

        h.controller.resume();
        let builds = h.builds_started();
        assert_eq!(builds.len(), 1);
        assert_eq!(
            builds[0].modified_files,
            Some([PathBuf::from("a")].into_iter().collect())
        );
    }

    #[test]
    fn close_during_build_defers_teardown_and_drops_result() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        h.controller.close(Some(tx1));
        h.controller.close(Some(tx2));
        assert!(rx1.try_recv().is_err(), "teardown waits for the build");

        h.finish(output_with("a"));
        let effects = h.controller.take_effects();
        assert!(!effects.iter().any(|e| matches!(e, ControllerEffect::Report(_))));
        assert!(effects.iter().any(|e| matches!(
            e,
            ControllerEffect::Lifecycle(LifecycleEvent::WatchClosed { .. })
        )));
        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert!(matches!(rx2.try_recv(), Ok(Ok(()))));
        assert_eq!(h.fs.watch_count(), 0);
    }

    #[test]
    fn events_after_close_are_ignored() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();
        h.finish(output_with("a"));
        h.controller.take_effects();

        h.controller.close(None);
        h.controller.take_effects();
        assert!(h.fs.all_closed());

        // A delivery that was already in flight.
        h.controller.on_watch_event(
            1,
            WatchEvent::Aggregated(WatchDelivery {
                changes: [PathBuf::from("a")].into_iter().collect(),
                ..Default::default()
            }),
        );
        h.controller.invalidate(None);
        assert!(h.builds_started().is_empty());
    }

    #[test]
    fn watcher_failure_is_reported_as_error() {
        let mut h = Harness::new();
        h.controller.initial_tick();
        h.builds_started();
        h.finish(output_with("a"));
        h.controller.take_effects();

        h.fs.emit_error("inotify limit reached");
        h.pump_watcher();
        let effects = h.controller.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            ControllerEffect::Report(Err(OrchestratorError::Watcher(_)))
        )));
    }

    #[test]
    fn failing_subscription_is_a_watcher_error() {
        let mut h = Harness::new();
        h.fs.fail_next_watch("no such device");
        h.controller.initial_tick();
        h.builds_started();
        h.finish(output_with("a"));

        let effects = h.controller.take_effects();
        assert!(effects.iter().any(|e| matches!(e, ControllerEffect::Report(Ok(_)))));
        assert!(effects.iter().any(|e| matches!(
            e,
            ControllerEffect::Report(Err(OrchestratorError::Watcher(_)))
        )));
    }
}
