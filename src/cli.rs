// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `multibuild`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "multibuild",
    version,
    about = "Build interdependent units in dependency order, and rebuild them on file changes.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Multibuild.toml")]
    pub config: String,

    /// Keep watching after the first build and rebuild on changes.
    #[arg(long)]
    pub watch: bool,

    /// Maximum number of units building at once (0 = no limit).
    ///
    /// Overrides `[group].parallelism`.
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MULTIBUILD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the units, but don't build anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
