// src/engine/core.rs

//! Pure core state machine of one `run` or `watch` invocation.
//!
//! [`GroupCore`] consumes [`RuntimeEvent`]s and produces:
//! - an updated scheduler / controller state
//! - a list of [`CoreCommand`]s describing what the IO shell should do next
//!
//! The async shell ([`crate::engine::runtime::GroupRuntime`]) spawns builds,
//! publishes lifecycle events and hands results to the caller. The core
//! itself owns no tasks and performs no IO; watcher sinks only post events
//! back into the actor's channel, so it can be driven step by step in tests.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::hooks::{SharedScheduler, lock};
use crate::dag::{CompletionTracker, DependencyGraph, DoneOutcome, Scheduler, SchedulerLink};
use crate::engine::controller::{ControllerEffect, WatchController};
use crate::engine::{Ack, CoreCommand, CoreStep, LifecycleEvent, RuntimeEvent};
use crate::errors::{OrchestratorError, Result};
use crate::types::{Parallelism, UnitId};
use crate::unit::{BuildOutput, BuildRequest, BuildStats};
use crate::watch::{WatchFileSystem, WatchOptions};

/// Watch configuration of one unit.
#[derive(Debug, Clone, Default)]
pub struct WatchSlot {
    pub fs: Option<Arc<dyn WatchFileSystem>>,
    pub options: WatchOptions,
}

#[derive(Debug)]
enum Mode {
    /// One wave, then stop. Every unit gets the same request.
    Run(BuildRequest),
    Watch,
}

/// Close of every controller in progress.
#[derive(Debug, Default)]
struct Closing {
    remaining: usize,
    first_error: Option<OrchestratorError>,
    /// Callers of `GroupWatching::close`.
    acks: Vec<Ack>,
    /// Hard failure to deliver once everything is closed.
    failure: Option<OrchestratorError>,
}

/// Scheduling core of a group.
#[derive(Debug)]
pub struct GroupCore {
    mode: Mode,
    scheduler: SharedScheduler,
    names: Vec<Option<String>>,
    /// One per unit in watch mode, empty in run mode.
    controllers: Vec<WatchController>,
    tracker: CompletionTracker,
    closing: Option<Closing>,
    commands: Vec<CoreCommand>,
}

impl GroupCore {
    /// Core for a single `run`.
    pub fn for_run(
        graph: &DependencyGraph,
        names: Vec<Option<String>>,
        parallelism: Parallelism,
        request: BuildRequest,
    ) -> Self {
        let scheduler = Arc::new(Mutex::new(Scheduler::new(graph, parallelism)));
        Self {
            mode: Mode::Run(request),
            scheduler,
            names,
            controllers: Vec::new(),
            tracker: CompletionTracker::new(graph.len()),
            closing: None,
            commands: Vec::new(),
        }
    }

    /// Core for a `watch` session: one controller per unit, each linked to
    /// its scheduler node.
    pub fn for_watch(
        graph: &DependencyGraph,
        names: Vec<Option<String>>,
        parallelism: Parallelism,
        slots: Vec<WatchSlot>,
        events: mpsc::UnboundedSender<RuntimeEvent>,
    ) -> Self {
        let scheduler: SharedScheduler = Arc::new(Mutex::new(Scheduler::new(graph, parallelism)));
        let controllers = graph
            .units()
            .zip(slots)
            .map(|(unit, slot)| {
                WatchController::new(
                    unit,
                    names.get(unit.index()).cloned().flatten(),
                    slot.fs,
                    slot.options,
                    events.clone(),
                    Box::new(SchedulerLink::new(unit, Arc::clone(&scheduler))),
                )
            })
            .collect();

        Self {
            mode: Mode::Watch,
            scheduler,
            names,
            controllers,
            tracker: CompletionTracker::new(graph.len()),
            closing: None,
            commands: Vec::new(),
        }
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    fn is_watch(&self) -> bool {
        matches!(self.mode, Mode::Watch)
    }

    /// First dispatch, before any event is processed.
    pub fn start(&mut self) -> CoreStep {
        if !self.is_watch() && lock(&self.scheduler).is_empty() {
            info!("run requested on an empty group");
            self.commands.push(CoreCommand::ReleaseGroup);
            self.commands
                .push(CoreCommand::Deliver(Ok(Default::default())));
            return self.finish(false);
        }
        let keep_running = self.pump();
        self.finish(keep_running)
    }

    /// Handle a single runtime event.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        let keep_running = match event {
            RuntimeEvent::InitialTick => {
                let mut keep_running = true;
                for i in 0..self.controllers.len() {
                    self.controllers[i].initial_tick();
                    keep_running &= self.absorb(UnitId(i));
                }
                keep_running
            }
            RuntimeEvent::BuildFinished {
                unit,
                started,
                finished,
                result,
            } => self.on_build_finished(unit, started, finished, result),
            RuntimeEvent::Watcher {
                unit,
                generation,
                event,
            } => {
                match self.controllers.get_mut(unit.index()) {
                    Some(controller) => {
                        controller.on_watch_event(generation, event);
                        self.absorb(unit)
                    }
                    None => true,
                }
            }
            RuntimeEvent::Invalidate { acks } => {
                let mut acks = acks.into_iter();
                let mut keep_running = true;
                for i in 0..self.controllers.len() {
                    self.controllers[i].invalidate(acks.next());
                    keep_running &= self.absorb(UnitId(i));
                }
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
                keep_running
            }
            RuntimeEvent::Suspend => {
                debug!("suspending every unit");
                for controller in &mut self.controllers {
                    controller.suspend();
                }
                true
            }
            RuntimeEvent::Resume => {
                debug!("resuming every unit");
                let mut keep_running = true;
                for i in 0..self.controllers.len() {
                    self.controllers[i].resume();
                    keep_running &= self.absorb(UnitId(i));
                }
                keep_running
            }
            RuntimeEvent::Close { ack } => self.request_close(Some(ack), None),
            RuntimeEvent::Shutdown => {
                self.commands.push(CoreCommand::ReleaseGroup);
                false
            }
        };

        let keep_running = keep_running && self.pump();
        self.finish(keep_running)
    }

    fn finish(&mut self, keep_running: bool) -> CoreStep {
        CoreStep {
            commands: mem::take(&mut self.commands),
            keep_running,
        }
    }

    /// Start whatever the scheduler allows, then look for a completed wave.
    ///
    /// Returns `false` when the invocation is over.
    fn pump(&mut self) -> bool {
        loop {
            let next = lock(&self.scheduler).next_startable();
            let Some(unit) = next else {
                break;
            };

            let run_request = match &self.mode {
                Mode::Run(request) => Some(request.clone()),
                Mode::Watch => None,
            };
            match run_request {
                Some(request) => {
                    self.commands
                        .push(CoreCommand::Publish(LifecycleEvent::RunStarted { unit }));
                    self.commands.push(CoreCommand::StartBuild { unit, request });
                }
                None => {
                    let controller = &mut self.controllers[unit.index()];
                    if !controller.is_running() {
                        controller.invalidate(None);
                    }
                    if !self.absorb(unit) {
                        return false;
                    }
                }
            }
            lock(&self.scheduler).mark_running(unit);
        }

        let wave = lock(&self.scheduler).take_wave();
        let Some(wave) = wave else {
            return true;
        };
        info!(units = wave.len(), labels = ?wave.labels(), "wave complete");
        if self.is_watch() {
            self.commands.push(CoreCommand::Deliver(Ok(wave)));
            true
        } else {
            self.commands.push(CoreCommand::ReleaseGroup);
            self.commands.push(CoreCommand::Deliver(Ok(wave)));
            false
        }
    }

    fn on_build_finished(
        &mut self,
        unit: UnitId,
        started: SystemTime,
        finished: SystemTime,
        result: anyhow::Result<BuildOutput>,
    ) -> bool {
        if self.is_watch() {
            if let Some(controller) = self.controllers.get_mut(unit.index()) {
                controller.on_build_finished(result, finished);
                return self.absorb(unit);
            }
            return true;
        }

        let report = match result {
            Ok(output) => {
                let stats = BuildStats::new(
                    unit,
                    self.names.get(unit.index()).cloned().flatten(),
                    started,
                    finished,
                    output,
                );
                self.publish_lifecycle(LifecycleEvent::Done {
                    unit,
                    stats: stats.clone(),
                });
                Ok(stats)
            }
            Err(err) => {
                let label = lock(&self.scheduler).label(unit).to_string();
                let err = OrchestratorError::BuildFailed {
                    unit: label,
                    message: format!("{err:#}"),
                };
                self.publish_lifecycle(LifecycleEvent::Failed {
                    unit,
                    error: err.clone(),
                });
                Err(err)
            }
        };
        self.report(unit, report)
    }

    /// Translate the effects a controller produced into commands.
    fn absorb(&mut self, unit: UnitId) -> bool {
        let Some(controller) = self.controllers.get_mut(unit.index()) else {
            return true;
        };
        let mut keep_running = true;
        for effect in controller.take_effects() {
            keep_running &= match effect {
                ControllerEffect::StartBuild(request) => {
                    self.commands.push(CoreCommand::StartBuild { unit, request });
                    true
                }
                ControllerEffect::Lifecycle(event) => {
                    self.publish_lifecycle(event);
                    true
                }
                ControllerEffect::Report(result) => self.report(unit, result),
                ControllerEffect::Closed(result) => self.on_controller_closed(result),
            };
        }
        keep_running
    }

    fn publish_lifecycle(&mut self, event: LifecycleEvent) {
        let all_done = match &event {
            LifecycleEvent::Invalid { unit, .. } => {
                self.tracker.invalid(*unit);
                None
            }
            LifecycleEvent::Done { stats, .. } => self.tracker.done(stats.clone()),
            _ => None,
        };
        self.commands.push(CoreCommand::Publish(event));
        if let Some(all) = all_done {
            self.commands
                .push(CoreCommand::Publish(LifecycleEvent::AllDone(all)));
        }
    }

    fn report(&mut self, unit: UnitId, result: Result<BuildStats>) -> bool {
        let outcome = lock(&self.scheduler).node_done(unit, result);
        match outcome {
            DoneOutcome::Accepted | DoneOutcome::Ignored => true,
            DoneOutcome::HardFailure(err) => {
                warn!(error = %err, "group failed");
                if self.is_watch() {
                    self.request_close(None, Some(err))
                } else {
                    self.commands.push(CoreCommand::ReleaseGroup);
                    self.commands.push(CoreCommand::Deliver(Err(err)));
                    false
                }
            }
        }
    }

    /// Close every controller. Joins a close already in progress.
    fn request_close(&mut self, ack: Option<Ack>, failure: Option<OrchestratorError>) -> bool {
        if let Some(closing) = self.closing.as_mut() {
            closing.acks.extend(ack);
            if closing.failure.is_none() {
                closing.failure = failure;
            }
            return true;
        }

        self.closing = Some(Closing {
            remaining: self.controllers.len(),
            first_error: None,
            acks: ack.into_iter().collect(),
            failure,
        });

        if self.controllers.is_empty() {
            return self.finish_closing();
        }

        let mut keep_running = true;
        for i in 0..self.controllers.len() {
            self.controllers[i].close(None);
            keep_running &= self.absorb(UnitId(i));
        }
        keep_running
    }

    fn on_controller_closed(&mut self, result: Result<()>) -> bool {
        let Some(closing) = self.closing.as_mut() else {
            return true;
        };
        if let Err(err) = result {
            closing.first_error.get_or_insert(err);
        }
        closing.remaining = closing.remaining.saturating_sub(1);
        if closing.remaining == 0 {
            self.finish_closing()
        } else {
            true
        }
    }

    fn finish_closing(&mut self) -> bool {
        let Some(closing) = self.closing.take() else {
            return true;
        };
        if let Some(err) = closing.failure {
            self.commands.push(CoreCommand::Deliver(Err(err)));
        }
        if closing.acks.is_empty() {
            // Closed because of a failure; the caller still owns the session.
            return true;
        }

        info!("group watch session closed");
        self.commands
            .push(CoreCommand::Publish(LifecycleEvent::GroupWatchClosed));
        self.commands.push(CoreCommand::ReleaseGroup);
        self.commands.push(CoreCommand::Acknowledge {
            acks: closing.acks,
            result: closing.first_error.map_or(Ok(()), Err),
        });
        false
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::oneshot;

    use super::*;
    use crate::dag::{NodeState, UnitDecl};
    use crate::watch::MockWatchFileSystem;

    fn graph(decls: &[(&str, &[&str])]) -> (DependencyGraph, Vec<Option<String>>) {
        let decls: Vec<UnitDecl> = decls
            .iter()
            .map(|(name, deps)| UnitDecl::new(Some(name), deps))
            .collect();
        let names = decls.iter().map(|d| d.name.clone()).collect();
        (DependencyGraph::resolve(&decls).unwrap(), names)
    }

    fn started(step: &CoreStep) -> Vec<UnitId> {
        step.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::StartBuild { unit, .. } => Some(*unit),
                _ => None,
            })
            .collect()
    }

    fn delivered(step: &CoreStep) -> Option<&Result<crate::dag::AggregateResult>> {
        step.commands.iter().find_map(|c| match c {
            CoreCommand::Deliver(result) => Some(result),
            _ => None,
        })
    }

    fn finished(unit: usize, result: anyhow::Result<BuildOutput>) -> RuntimeEvent {
        let now = SystemTime::now();
        RuntimeEvent::BuildFinished {
            unit: UnitId(unit),
            started: now,
            finished: now,
            result,
        }
    }

    fn output(file: &str) -> BuildOutput {
        BuildOutput {
            file_dependencies: [PathBuf::from(file)].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn run_builds_dependencies_first_and_delivers_in_construction_order() {
        let (graph, names) = graph(&[("a", &["b"]), ("b", &[])]);
        let mut core =
            GroupCore::for_run(&graph, names, Parallelism::unbounded(), BuildRequest::default());

        let step = core.start();
        assert_eq!(started(&step), vec![UnitId(1)]);
        assert!(step.keep_running);

        let step = core.step(finished(1, Ok(BuildOutput::default())));
        assert_eq!(started(&step), vec![UnitId(0)]);
        assert!(delivered(&step).is_none());

        let step = core.step(finished(0, Ok(BuildOutput::default())));
        assert!(!step.keep_running);
        let wave = delivered(&step).unwrap().as_ref().unwrap();
        assert_eq!(wave.labels(), vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(step.commands[0], CoreCommand::Publish(LifecycleEvent::Done { .. })));
        assert!(step.commands.iter().any(|c| matches!(
            c,
            CoreCommand::Publish(LifecycleEvent::AllDone(all)) if all.len() == 2
        )));
    }

    #[test]
    fn run_failure_is_delivered_once_and_stops() {
        let (graph, names) = graph(&[("a", &[]), ("b", &[])]);
        let mut core =
            GroupCore::for_run(&graph, names, Parallelism::unbounded(), BuildRequest::default());
        assert_eq!(core.start().commands.len(), 4);

        let step = core.step(finished(0, Err(anyhow::anyhow!("boom"))));
        assert!(!step.keep_running);
        match delivered(&step) {
            Some(Err(OrchestratorError::BuildFailed { unit, message })) => {
                assert_eq!(unit, "a");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected delivery {other:?}"),
        }
        assert!(step.commands.iter().any(|c| matches!(c, CoreCommand::ReleaseGroup)));
    }

    #[test]
    fn empty_run_delivers_empty_result() {
        let (graph, names) = graph(&[]);
        let mut core =
            GroupCore::for_run(&graph, names, Parallelism::unbounded(), BuildRequest::default());
        let step = core.start();
        assert!(!step.keep_running);
        assert!(matches!(delivered(&step), Some(Ok(wave)) if wave.is_empty()));
    }

    #[test]
    fn run_respects_parallelism() {
        let (graph, names) = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let mut core =
            GroupCore::for_run(&graph, names, Parallelism::limited(1), BuildRequest::default());
        assert_eq!(started(&core.start()).len(), 1);
        let step = core.step(finished(0, Ok(BuildOutput::default())));
        assert_eq!(started(&step).len(), 1);
    }

    struct WatchHarness {
        core: GroupCore,
        fs: Vec<MockWatchFileSystem>,
        events: mpsc::UnboundedReceiver<RuntimeEvent>,
    }

    impl WatchHarness {
        fn new(decls: &[(&str, &[&str])]) -> Self {
            let (graph, names) = graph(decls);
            let fs: Vec<MockWatchFileSystem> =
                (0..graph.len()).map(|_| MockWatchFileSystem::new()).collect();
            let slots = fs
                .iter()
                .map(|fs| WatchSlot {
                    fs: Some(Arc::new(fs.clone()) as Arc<dyn WatchFileSystem>),
                    options: WatchOptions::default(),
                })
                .collect();
            let (tx, events) = mpsc::unbounded_channel();
            let core = GroupCore::for_watch(&graph, names, Parallelism::unbounded(), slots, tx);
            Self { core, fs, events }
        }

        /// Feed queued watcher notifications to the core.
        fn drain(&mut self) -> Vec<CoreStep> {
            let mut steps = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                steps.push(self.core.step(event));
            }
            steps
        }

        fn state(&self, unit: usize) -> NodeState {
            lock(self.core.scheduler()).state_of(UnitId(unit)).unwrap()
        }
    }

    #[test]
    fn watch_builds_roots_then_dependents_and_delivers_a_wave() {
        let mut h = WatchHarness::new(&[("a", &["b"]), ("b", &[])]);
        let step = h.core.start();
        assert_eq!(started(&step), vec![UnitId(1)]);

        // The deferred first invalidation must not start anything twice.
        let step = h.core.step(RuntimeEvent::InitialTick);
        assert!(started(&step).is_empty());

        let step = h.core.step(finished(1, Ok(output("b.txt"))));
        assert_eq!(started(&step), vec![UnitId(0)]);
        assert_eq!(h.fs[1].watch_count(), 1);

        let step = h.core.step(finished(0, Ok(output("a.txt"))));
        let wave = delivered(&step).unwrap().as_ref().unwrap();
        assert_eq!(wave.len(), 2);
        assert!(step.keep_running);
    }

    #[test]
    fn change_in_dependency_rebuilds_dependent() {
        let mut h = WatchHarness::new(&[("a", &["b"]), ("b", &[])]);
        h.core.start();
        h.core.step(RuntimeEvent::InitialTick);
        h.core.step(finished(1, Ok(output("b.txt"))));
        h.core.step(finished(0, Ok(output("a.txt"))));
        assert_eq!(h.state(0), NodeState::Done);

        assert!(h.fs[1].emit_file_change("b.txt"));
        let steps = h.drain();
        let restarted: Vec<UnitId> = steps.iter().flat_map(started).collect();
        assert_eq!(restarted, vec![UnitId(1)]);
        assert_eq!(h.state(0), NodeState::Blocked);

        let step = h.core.step(finished(1, Ok(output("b.txt"))));
        assert_eq!(started(&step), vec![UnitId(0)]);
        let step = h.core.step(finished(0, Ok(output("a.txt"))));
        assert_eq!(delivered(&step).unwrap().as_ref().unwrap().len(), 2);
    }

    #[test]
    fn watch_failure_closes_everything_then_delivers() {
        let mut h = WatchHarness::new(&[("a", &[]), ("b", &[])]);
        h.core.start();

        let step = h.core.step(finished(0, Err(anyhow::anyhow!("bad input"))));
        // `b` is still building: its teardown is pending.
        assert!(delivered(&step).is_none());
        assert!(step.keep_running);

        let step = h.core.step(finished(1, Ok(output("b.txt"))));
        assert!(matches!(
            delivered(&step),
            Some(Err(OrchestratorError::BuildFailed { .. }))
        ));
        assert_eq!(h.fs[1].watch_count(), 0);

        // The caller closes afterwards; every controller is already closed.
        let (tx, mut rx) = oneshot::channel();
        let step = h.core.step(RuntimeEvent::Close { ack: tx });
        assert!(!step.keep_running);
        let acks = step.commands.into_iter().find_map(|c| match c {
            CoreCommand::Acknowledge { acks, result } => Some((acks, result)),
            _ => None,
        });
        let (acks, result) = acks.unwrap();
        assert!(result.is_ok());
        for ack in acks {
            ack.send(Ok(())).unwrap();
        }
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn close_acknowledges_after_all_controllers_tear_down() {
        let mut h = WatchHarness::new(&[("a", &[])]);
        h.core.start();
        let (tx, _rx) = oneshot::channel();
        let step = h.core.step(RuntimeEvent::Close { ack: tx });
        assert!(step.keep_running, "the running build defers teardown");

        let step = h.core.step(finished(0, Ok(output("a.txt"))));
        assert!(!step.keep_running);
        assert!(delivered(&step).is_none());
        assert!(step.commands.iter().any(|c| matches!(
            c,
            CoreCommand::Publish(LifecycleEvent::GroupWatchClosed)
        )));
        assert_eq!(h.fs[0].watch_count(), 0);
    }
}
