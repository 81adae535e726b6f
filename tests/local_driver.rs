// tests/local_driver.rs

#![cfg(unix)]

use std::time::Duration;

use expctl::config::ControllerConfig;
use expctl::drivers::{self, LocalApplication, LocalNode};
use expctl::engine::{ExperimentController, WaitOutcome};
use expctl::errors::ExpctlError;
use expctl::resource::{AttrValue, Filters, ResourceType, TraceOutput, TraceQuery};
use expctl::types::{FailureLevel, ResourceState};
use expctl_test_utils::init_tracing;

fn local_controller() -> (tempfile::TempDir, ExperimentController) {
    init_tracing();
    let root = tempfile::tempdir().expect("failed to create temp dir");
    let config = ControllerConfig::default()
        .with_worker_threads(4)
        .with_reschedule_delay(Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(10))
        .with_start_barrier_interval(Duration::from_millis(20))
        .with_root_dir(root.path());
    let ec = ExperimentController::with_config(config, drivers::local::factory())
        .expect("controller should start");
    (root, ec)
}

fn app_on_node(ec: &ExperimentController, command: &str) -> u64 {
    let node = ec.register_resource(LocalNode::RTYPE).unwrap();
    let app = ec.register_resource(LocalApplication::RTYPE).unwrap();
    ec.register_connection(node, app).unwrap();
    ec.set(app, "command", command).unwrap();
    ec.register_trace(app, "stdout").unwrap();
    app
}

#[test]
fn command_output_is_captured_as_a_trace() {
    let (root, ec) = local_controller();
    let app = app_on_node(&ec, "echo hello");

    ec.deploy().unwrap();
    assert_eq!(ec.wait_finished(&[app]).unwrap(), WaitOutcome::Reached);
    assert_eq!(ec.state(app).unwrap(), ResourceState::Finished);

    let stdout = ec.trace(app, "stdout", TraceQuery::All).unwrap();
    assert_eq!(stdout.as_text().as_deref(), Some("hello\n"));
    match ec.trace(app, "stdout", TraceQuery::Path).unwrap() {
        TraceOutput::Path(path) => assert!(path.starts_with(root.path())),
        other => panic!("expected a path, got {other:?}"),
    }

    assert!(ec.shutdown().is_clean());
    assert_eq!(ec.failure_level(), FailureLevel::Ok);
}

#[test]
fn environment_pairs_reach_the_command() {
    let (_root, ec) = local_controller();
    let app = app_on_node(&ec, "printf '%s' \"$GREETING\"");
    ec.set(app, "env", "GREETING=hola").unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_finished(&[app]).unwrap(), WaitOutcome::Reached);
    let stdout = ec.trace(app, "stdout", TraceQuery::All).unwrap();
    assert_eq!(stdout.as_text().as_deref(), Some("hola"));
}

#[test]
fn nonzero_exit_fails_the_application() {
    let (_root, ec) = local_controller();
    let app = app_on_node(&ec, "exit 3");

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_finished(&[app]).unwrap(),
        WaitOutcome::Failed(vec![app])
    );
    let reason = ec.resource(app).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("exited"), "{reason}");
    assert_eq!(ec.failure_level(), FailureLevel::ResourceFailure);
}

#[test]
fn long_running_command_is_killed_on_shutdown() {
    let (_root, ec) = local_controller();
    let app = app_on_node(&ec, "sleep 30");

    ec.deploy().unwrap();
    assert_eq!(ec.wait_started(&[app]).unwrap(), WaitOutcome::Reached);

    let report = ec.shutdown();
    assert!(report.is_clean(), "{report:?}");
    assert!(report.stopped.contains(&app));
    assert_eq!(ec.state(app).unwrap(), ResourceState::Released);
}

#[test]
fn application_without_node_cannot_deploy() {
    let (_root, ec) = local_controller();
    let app = ec.register_resource(LocalApplication::RTYPE).unwrap();
    ec.set(app, "command", "true").unwrap();

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_deployed(&[app]).unwrap(),
        WaitOutcome::Failed(vec![app])
    );
    let reason = ec.resource(app).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("not connected to a node"), "{reason}");
}

#[test]
fn application_without_command_cannot_deploy() {
    let (_root, ec) = local_controller();
    let node = ec.register_resource(LocalNode::RTYPE).unwrap();
    let app = ec.register_resource(LocalApplication::RTYPE).unwrap();
    ec.register_connection(node, app).unwrap();

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_deployed(&[app]).unwrap(),
        WaitOutcome::Failed(vec![app])
    );
}

#[test]
fn applications_only_connect_to_nodes() {
    let (_root, ec) = local_controller();
    let a = ec.register_resource(LocalApplication::RTYPE).unwrap();
    let b = ec.register_resource(LocalApplication::RTYPE).unwrap();

    assert!(matches!(
        ec.register_connection(a, b),
        Err(ExpctlError::InvalidConnection { .. })
    ));
}

#[test]
fn stdout_is_unavailable_before_start() {
    let (_root, ec) = local_controller();
    let app = app_on_node(&ec, "echo hi");

    assert!(matches!(
        ec.trace(app, "stdout", TraceQuery::All),
        Err(ExpctlError::TraceUnavailable { .. })
    ));
}

#[test]
fn node_discovery_matches_the_hostname_filter() {
    let (_root, ec) = local_controller();
    let here = ec.register_resource(LocalNode::RTYPE).unwrap();
    let elsewhere = ec.register_resource(LocalNode::RTYPE).unwrap();

    let local = Filters::from([("hostname".to_string(), AttrValue::from("localhost"))]);
    assert_eq!(ec.discover(here, &local).unwrap(), ResourceState::Discovered);

    let remote = Filters::from([("hostname".to_string(), AttrValue::from("far-away"))]);
    assert_eq!(ec.discover(elsewhere, &remote).unwrap(), ResourceState::Failed);
    let reason = ec.resource(elsewhere).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("far-away"), "{reason}");
}
