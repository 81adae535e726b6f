// tests/async_wait.rs

mod common;
use crate::common::fake_controller;

use std::sync::Arc;
use std::time::Duration;

use expctl::engine::{WaitFor, WaitOutcome};
use expctl::resource::ResourceType;
use expctl::types::ResourceState;
use expctl_test_utils::fakes::{FakeApplication, FakeNode, Probe};
use expctl_test_utils::with_timeout;

#[tokio::test]
async fn async_wait_reaches_the_target() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);
    let node = ec.register_resource(FakeNode::RTYPE).unwrap();
    let app = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.register_connection(node, app).unwrap();
    ec.set(app, "run_time", 0.05).unwrap();

    ec.deploy().unwrap();
    let outcome = with_timeout(ec.wait_async(&[app], WaitFor::Finished, None))
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Reached);

    let outcome = with_timeout(ec.wait_async(&[node], WaitFor::State(ResourceState::Ready), None))
        .await
        .unwrap();
    assert!(outcome.is_reached());
}

#[tokio::test]
async fn async_wait_times_out() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);
    let app = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(app, "run_time", -1.0).unwrap();

    ec.deploy().unwrap();
    let outcome = with_timeout(ec.wait_async(
        &[app],
        WaitFor::Finished,
        Some(Duration::from_millis(100)),
    ))
    .await
    .unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[tokio::test]
async fn async_wait_is_aborted_by_shutdown() {
    let probe = Probe::new();
    let ec = Arc::new(fake_controller(&probe));
    let app = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(app, "run_time", -1.0).unwrap();
    ec.deploy().unwrap();

    let closer = Arc::clone(&ec);
    let shutdown = tokio::task::spawn_blocking(move || {
        std::thread::sleep(Duration::from_millis(100));
        closer.shutdown()
    });

    // The app never fails, so only the shutdown can end this wait.
    let outcome = with_timeout(ec.wait_async(
        &[app],
        WaitFor::State(ResourceState::Failed),
        None,
    ))
    .await
    .unwrap();
    assert_eq!(outcome, WaitOutcome::Aborted);
    assert!(shutdown.await.unwrap().is_clean());
}
