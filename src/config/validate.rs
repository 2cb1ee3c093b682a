// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::dag::{DependencyGraph, UnitDecl};
use crate::errors::{OrchestratorError, Result};
use crate::watch::patterns::{PatternSet, UnitPatterns};

/// Longest accepted aggregation window.
pub const MAX_AGGREGATE_TIMEOUT: Duration = Duration::from_secs(60);

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = OrchestratorError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_units(cfg)?;
    validate_watch(cfg)?;
    validate_units(cfg)?;
    validate_dependencies(cfg)?;
    Ok(())
}

fn ensure_has_units(cfg: &RawConfigFile) -> Result<()> {
    if cfg.unit.is_empty() {
        return Err(OrchestratorError::ConfigError(
            "config must contain at least one [unit.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_watch(cfg: &RawConfigFile) -> Result<()> {
    let timeout = cfg.watch.aggregate_timeout();
    if timeout > MAX_AGGREGATE_TIMEOUT {
        return Err(OrchestratorError::ConfigError(format!(
            "[watch].aggregate_timeout_ms must be <= {} (got {})",
            MAX_AGGREGATE_TIMEOUT.as_millis(),
            timeout.as_millis()
        )));
    }
    if let Some(ignored) = &cfg.watch.ignored {
        PatternSet::new(ignored)
            .map_err(|e| OrchestratorError::ConfigError(format!("[watch].ignored: {e:#}")))?;
    }
    Ok(())
}

fn validate_units(cfg: &RawConfigFile) -> Result<()> {
    let defaults = crate::watch::WatchDefaults {
        watch: cfg.default.watch.clone(),
        exclude: cfg.default.exclude.clone(),
    };
    for (name, unit) in &cfg.unit {
        if unit.cmd.trim().is_empty() {
            return Err(OrchestratorError::ConfigError(format!(
                "unit '{name}' has an empty `cmd`"
            )));
        }
        UnitPatterns::compile(
            name,
            &defaults,
            unit.watch.as_deref(),
            unit.exclude.as_deref(),
            unit.append_default_watch,
        )
        .map_err(|e| OrchestratorError::ConfigError(format!("unit '{name}': {e:#}")))?;
    }
    Ok(())
}

/// Same resolver the scheduler uses, so a config that loads always builds.
fn validate_dependencies(cfg: &RawConfigFile) -> Result<()> {
    let decls: Vec<UnitDecl> = cfg
        .unit
        .iter()
        .map(|(name, unit)| UnitDecl {
            name: Some(name.clone()),
            dependencies: unit.dependencies.clone(),
        })
        .collect();
    DependencyGraph::resolve(&decls).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::UnitConfig;
    use crate::types::Parallelism;

    fn raw(units: &[(&str, &[&str])]) -> RawConfigFile {
        let mut cfg = RawConfigFile::default();
        for (name, deps) in units {
            let mut unit = UnitConfig::new(format!("echo {name}"));
            unit.dependencies = deps.iter().map(|d| d.to_string()).collect();
            cfg.unit.insert(name.to_string(), unit);
        }
        cfg
    }

    #[test]
    fn accepts_a_valid_chain() {
        let cfg = ConfigFile::try_from(raw(&[("app", &["lib"]), ("lib", &[])])).unwrap();
        assert_eq!(cfg.unit.len(), 2);
    }

    #[test]
    fn rejects_empty_config() {
        let err = ConfigFile::try_from(RawConfigFile::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError(_)));
    }

    #[test]
    fn reports_unknown_dependency() {
        let err = ConfigFile::try_from(raw(&[("app", &["nope"])])).unwrap_err();
        assert_eq!(err.to_string(), "Unit dependency `nope` not found.");
    }

    #[test]
    fn reports_cycles() {
        let err = ConfigFile::try_from(raw(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Circular dependency found in unit dependencies."));
        assert!(text.contains("a -> b"));
        assert!(text.contains("b -> a"));
    }

    #[test]
    fn zero_parallelism_means_unbounded() {
        let mut cfg = raw(&[("a", &[])]);
        cfg.group.parallelism = Some(0);
        let cfg = ConfigFile::try_from(cfg).unwrap();
        assert_eq!(cfg.parallelism(), Parallelism::unbounded());
    }

    #[test]
    fn rejects_huge_timeouts() {
        let mut cfg = raw(&[("a", &[])]);
        cfg.watch.aggregate_timeout_ms = Some(120_000);
        assert!(ConfigFile::try_from(cfg).is_err());
    }

    #[test]
    fn rejects_blank_commands_and_bad_globs() {
        let mut cfg = raw(&[("a", &[])]);
        cfg.unit.get_mut("a").unwrap().cmd = "  ".into();
        assert!(ConfigFile::try_from(cfg).is_err());

        let mut cfg = raw(&[("a", &[])]);
        cfg.unit.get_mut("a").unwrap().watch = Some(vec!["src/[".into()]);
        assert!(ConfigFile::try_from(cfg).is_err());
    }
}
