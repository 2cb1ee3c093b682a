#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use multibuild::dag::AggregateResult;
use multibuild::engine::{BuildGroup, GroupOptions, GroupWatching};
use multibuild::types::Parallelism;
use multibuild::unit::BuildUnit;

pub use multibuild_test_utils::{BuildLog, FakeUnit, Gate, init_tracing, settle, with_timeout};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Group over `units` in the given order.
pub fn group_of(units: &[Arc<FakeUnit>], parallelism: Parallelism) -> BuildGroup {
    let units = units
        .iter()
        .map(|u| Arc::clone(u) as Arc<dyn BuildUnit>)
        .collect();
    BuildGroup::new(units, GroupOptions { parallelism })
}

/// Wait for the next wave of a watch session and fail the test on errors.
pub async fn next_wave(watching: &mut GroupWatching) -> AggregateResult {
    with_timeout(watching.next_result())
        .await
        .expect("watch session ended")
        .expect("wave failed")
}

/// Assert that no wave arrives for a while.
pub async fn assert_quiet(watching: &mut GroupWatching) {
    let res = tokio::time::timeout(Duration::from_millis(150), watching.next_result()).await;
    assert!(res.is_err(), "unexpected wave: {:?}", res);
}
