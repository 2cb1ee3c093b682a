// tests/command_units.rs
#![cfg(unix)]

use std::fs;

use tempfile::tempdir;

use multibuild::build_group;
use multibuild::config::load_and_validate;
use multibuild::types::Parallelism;
use multibuild_test_utils::builders::write_config;
use multibuild_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn commands_run_in_dependency_order() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[unit.app]
cmd = "echo app >> order.txt"
dependencies = ["lib"]

[unit.lib]
cmd = "sleep 0.05 && echo lib >> order.txt"
"#,
    );
    let cfg = load_and_validate(&path)?;
    let group = build_group(&cfg, dir.path(), cfg.parallelism())?;

    let wave = with_timeout(group.run()).await?;

    assert_eq!(wave.labels(), vec!["app", "lib"]);
    assert!(!wave.has_errors());
    assert_eq!(fs::read_to_string(dir.path().join("order.txt"))?, "lib\napp\n");
    group.close().await?;
    Ok(())
}

#[tokio::test]
async fn failing_command_is_reported_as_a_unit_error() -> TestResult {
    let dir = tempdir()?;
    let path = write_config(
        dir.path(),
        r#"
[unit.broken]
cmd = "echo 'syntax error on line 3' >&2; exit 3"
"#,
    );
    let cfg = load_and_validate(&path)?;
    let group = build_group(&cfg, dir.path(), Parallelism::unbounded())?;

    let wave = with_timeout(group.run()).await?;

    assert!(wave.has_errors());
    let errors = &wave.stats()[0].output().errors;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("exited with status 3"), "{}", errors[0]);
    assert!(errors[0].contains("syntax error on line 3"), "{}", errors[0]);
    Ok(())
}

#[tokio::test]
async fn unchanged_inputs_skip_the_command_when_hashing() -> TestResult {
    let dir = tempdir()?;
    fs::create_dir(dir.path().join("src"))?;
    fs::write(dir.path().join("src/input.txt"), "one")?;
    let path = write_config(
        dir.path(),
        r#"
[unit.gen]
cmd = "echo run >> runs.txt"
watch = ["src/*.txt"]
use_hash = true
"#,
    );
    let cfg = load_and_validate(&path)?;
    let group = build_group(&cfg, dir.path(), Parallelism::unbounded())?;

    let first = with_timeout(group.run()).await?;
    let second = with_timeout(group.run()).await?;
    assert_eq!(first.hash(), second.hash());
    assert_eq!(fs::read_to_string(dir.path().join("runs.txt"))?, "run\n");

    let deps = &second.stats()[0].output().file_dependencies;
    assert!(deps.contains(&dir.path().join("src/input.txt")));

    fs::write(dir.path().join("src/input.txt"), "two")?;
    let third = with_timeout(group.run()).await?;
    assert_ne!(third.hash(), second.hash());
    assert_eq!(fs::read_to_string(dir.path().join("runs.txt"))?, "run\nrun\n");
    Ok(())
}
