// src/lib.rs

//! `multibuild` coordinates several build units that may depend on each
//! other: it builds them in dependency order under a parallelism budget and,
//! in watch mode, rebuilds exactly what a file change invalidates.
//!
//! The library entry points are [`engine::BuildGroup`] (`run` / `watch`) and
//! the [`unit::BuildUnit`] trait. The `multibuild` binary wires them to
//! [`unit::CommandUnit`]s described in a `Multibuild.toml`.

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod types;
pub mod unit;
pub mod watch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, config_root_dir, load_and_validate};
use crate::dag::AggregateResult;
use crate::engine::{BuildGroup, GroupOptions, LifecycleEvent, WatchSelection};
use crate::types::Parallelism;
use crate::unit::{BuildUnit, CommandUnit};
use crate::watch::{NotifyWatchFileSystem, UnitPatterns};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - one `CommandUnit` per `[unit.<name>]`, each with its own native watcher
/// - a single run, or a watch session until Ctrl-C
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let root = config_root_dir(&config_path);
    let parallelism = match args.parallelism {
        Some(0) => Parallelism::unbounded(),
        Some(n) => Parallelism::limited(n),
        None => cfg.parallelism(),
    };
    let group = build_group(&cfg, &root, parallelism)?;
    spawn_event_logger(&group);

    let outcome = if args.watch {
        watch_until_interrupted(&group, &cfg).await
    } else {
        run_once(&group).await
    };

    group.close().await.context("closing units")?;
    outcome
}

/// Create the group described by the config. Unit commands run in `root`.
pub fn build_group(cfg: &ConfigFile, root: &Path, parallelism: Parallelism) -> Result<BuildGroup> {
    let defaults = cfg.watch_defaults();
    let mut units: BTreeMap<String, Arc<dyn BuildUnit>> = BTreeMap::new();

    for (name, unit_cfg) in &cfg.unit {
        let patterns = UnitPatterns::compile(
            name,
            &defaults,
            unit_cfg.watch.as_deref(),
            unit_cfg.exclude.as_deref(),
            unit_cfg.append_default_watch,
        )?;
        let unit = CommandUnit::new(name, &unit_cfg.cmd, root, patterns)
            .with_dependencies(unit_cfg.dependencies.clone())
            .with_hash(unit_cfg.effective_use_hash(cfg.default.use_hash))
            .with_watch_file_system(Arc::new(NotifyWatchFileSystem::new()));
        units.insert(name.clone(), Arc::new(unit));
    }

    Ok(BuildGroup::from_named(units, GroupOptions { parallelism })?)
}

async fn run_once(group: &BuildGroup) -> Result<()> {
    let wave = group.run().await?;
    print_wave(&wave);
    if wave.has_errors() {
        bail!("{} unit(s) finished with errors", failing_units(&wave));
    }
    Ok(())
}

async fn watch_until_interrupted(group: &BuildGroup, cfg: &ConfigFile) -> Result<()> {
    let mut watching = group.watch(WatchSelection::Shared(cfg.watch_options()))?;
    info!("watching for changes; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("interrupted; closing watchers");
                break;
            }
            result = watching.next_result() => match result {
                Some(Ok(wave)) => print_wave(&wave),
                Some(Err(err)) => {
                    eprintln!("multibuild: {err}");
                    break;
                }
                None => break,
            },
        }
    }

    watching.close().await?;
    Ok(())
}

/// Forward lifecycle events to the log.
fn spawn_event_logger(group: &BuildGroup) {
    let mut events = group.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LifecycleEvent::Invalid { unit, path, .. } => {
                    debug!(unit = %unit, path = ?path, "invalidated");
                }
                LifecycleEvent::Failed { unit, error } => {
                    warn!(unit = %unit, error = %error, "unit failed");
                }
                LifecycleEvent::AllDone(all) => {
                    debug!(units = all.len(), errors = all.has_errors(), "all units up to date");
                }
                other => debug!(event = ?other, "lifecycle"),
            }
        }
    });
}

fn failing_units(wave: &AggregateResult) -> usize {
    wave.iter().filter(|s| s.has_errors()).count()
}

fn print_wave(wave: &AggregateResult) {
    for stats in wave.iter() {
        let status = if stats.has_errors() { "FAILED" } else { "ok" };
        println!(
            "[{status}] {} ({} ms)",
            stats.label(),
            stats.duration().as_millis()
        );
        for error in &stats.output().errors {
            println!("    {}", error.replace('\n', "\n    "));
        }
        for warning in &stats.output().warnings {
            println!("    warning: {warning}");
        }
    }
}

/// Print units, dependencies and commands.
fn print_dry_run(cfg: &ConfigFile) {
    println!("multibuild dry-run");
    match cfg.group.parallelism {
        Some(n) if n > 0 => println!("  group.parallelism = {n}"),
        _ => println!("  group.parallelism = unbounded"),
    }
    println!(
        "  watch.aggregate_timeout = {} ms",
        cfg.watch.aggregate_timeout().as_millis()
    );
    println!();

    println!("units ({}):", cfg.unit.len());
    for (name, unit) in &cfg.unit {
        println!("  - {name}");
        println!("      cmd: {}", unit.cmd);
        if !unit.dependencies.is_empty() {
            println!("      dependencies: {:?}", unit.dependencies);
        }
        if let Some(watch) = unit.watch.as_ref().filter(|w| !w.is_empty()) {
            println!("      watch: {watch:?}");
        }
        if let Some(exclude) = unit.exclude.as_ref().filter(|e| !e.is_empty()) {
            println!("      exclude: {exclude:?}");
        }
        if unit.effective_use_hash(cfg.default.use_hash) {
            println!("      use_hash: true");
        }
    }

    debug!("dry-run complete (nothing built)");
}
