// tests/controller_lifecycle.rs

mod common;
use crate::common::{PATIENCE, eventually, fake_controller, fake_controller_with};

use std::time::Duration;

use expctl::engine::{WaitFor, WaitOutcome};
use expctl::errors::ExpctlError;
use expctl::resource::{AttrValue, Filters, ResourceType, TraceOutput, TraceQuery};
use expctl::types::{FailureLevel, ResourceAction, ResourceState};
use expctl_test_utils::builders::fast_config;
use expctl_test_utils::fakes::{FakeApplication, FakeChannel, FakeInterface, FakeNode, Probe};

fn position(order: &[u64], guid: u64) -> usize {
    order
        .iter()
        .position(|g| *g == guid)
        .unwrap_or_else(|| panic!("guid {guid} never called"))
}

#[test]
fn deploy_runs_a_topology_to_completion() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let node1 = ec.register_resource(FakeNode::RTYPE).unwrap();
    let iface1 = ec.register_resource(FakeInterface::RTYPE).unwrap();
    let chan = ec.register_resource(FakeChannel::RTYPE).unwrap();
    let iface2 = ec.register_resource(FakeInterface::RTYPE).unwrap();
    let node2 = ec.register_resource(FakeNode::RTYPE).unwrap();
    let app = ec.register_resource(FakeApplication::RTYPE).unwrap();

    ec.register_connection(node1, iface1).unwrap();
    ec.register_connection(iface1, chan).unwrap();
    ec.register_connection(chan, iface2).unwrap();
    ec.register_connection(iface2, node2).unwrap();
    ec.register_connection(app, node1).unwrap();

    ec.deploy().unwrap();

    let infra = [node1, iface1, chan, iface2, node2];
    assert_eq!(ec.wait_finished(&[app]).unwrap(), WaitOutcome::Reached);
    assert_eq!(ec.wait_started(&infra).unwrap(), WaitOutcome::Reached);
    assert_eq!(ec.failure_level(), FailureLevel::Ok);

    // Interfaces deploy once their node is ready, the channel once both
    // interfaces are.
    let deploys = probe.order_of("deploy");
    assert!(position(&deploys, node1) < position(&deploys, iface1));
    assert!(position(&deploys, node2) < position(&deploys, iface2));
    assert!(position(&deploys, iface1) < position(&deploys, chan));
    assert!(position(&deploys, iface2) < position(&deploys, chan));
    assert!(position(&deploys, node1) < position(&deploys, app));

    let report = ec.shutdown();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.released.len(), 6);
    for guid in infra.iter().chain([&app]) {
        assert_eq!(ec.state(*guid).unwrap(), ResourceState::Released);
        assert_eq!(probe.count(*guid, "release"), 1);
    }
    assert_eq!(report.stopped.len(), infra.len());
}

#[test]
fn nothing_starts_before_everything_is_ready() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let slow = ec.register_resource(FakeNode::RTYPE).unwrap();
    let fast = ec.register_resource(FakeNode::RTYPE).unwrap();
    ec.set(slow, "deploy_delay", 0.2).unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_started(&[slow, fast]).unwrap(), WaitOutcome::Reached);

    let slow_ready = ec
        .resource(slow)
        .unwrap()
        .core()
        .reached_at(ResourceState::Ready)
        .unwrap();
    let fast_started = probe.last(fast, "start").unwrap();
    assert!(fast_started >= slow_ready);
}

#[test]
fn deploy_group_without_barrier_starts_each_when_ready() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let slow = ec.register_resource(FakeNode::RTYPE).unwrap();
    let fast = ec.register_resource(FakeNode::RTYPE).unwrap();
    ec.set(slow, "deploy_delay", 0.3).unwrap();

    ec.deploy_group(&[slow, fast], false).unwrap();
    assert_eq!(ec.wait_started(&[fast]).unwrap(), WaitOutcome::Reached);
    assert!(ec.state(slow).unwrap() < ResourceState::Started);
    assert_eq!(ec.wait_started(&[slow]).unwrap(), WaitOutcome::Reached);
}

#[test]
fn failed_node_blocks_what_depends_on_it() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let node = ec.register_resource(FakeNode::RTYPE).unwrap();
    let iface = ec.register_resource(FakeInterface::RTYPE).unwrap();
    let chan = ec.register_resource(FakeChannel::RTYPE).unwrap();
    let other = ec.register_resource(FakeNode::RTYPE).unwrap();
    ec.register_connection(node, iface).unwrap();
    ec.register_connection(iface, chan).unwrap();
    ec.set(node, "fail_on", "deploy").unwrap();

    ec.deploy().unwrap();

    assert_eq!(
        ec.wait_deployed(&[iface]).unwrap(),
        WaitOutcome::Failed(vec![iface])
    );
    assert!(eventually(PATIENCE, || {
        ec.state(chan).unwrap() == ResourceState::Failed
    }));
    assert_eq!(ec.state(node).unwrap(), ResourceState::Failed);
    assert_eq!(ec.wait_started(&[other]).unwrap(), WaitOutcome::Reached);
    assert_eq!(ec.failure_level(), FailureLevel::ResourceFailure);

    let node_rm = ec.resource(node).unwrap();
    let reason = node_rm.core().failure_reason().unwrap();
    assert!(reason.contains("fake deploy failure"), "{reason}");

    // The interface never got past waiting for its node.
    assert_eq!(probe.count(iface, "deploy"), 0);
    assert_eq!(probe.count(node, "start"), 0);
}

#[test]
fn driver_panic_fails_only_that_resource() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let bad = ec.register_resource(FakeNode::RTYPE).unwrap();
    let good = ec.register_resource(FakeNode::RTYPE).unwrap();
    ec.set(bad, "panic_on", "start").unwrap();

    ec.deploy().unwrap();

    assert_eq!(ec.wait_started(&[good]).unwrap(), WaitOutcome::Reached);
    assert_eq!(
        ec.wait_started(&[bad]).unwrap(),
        WaitOutcome::Failed(vec![bad])
    );
    assert_eq!(ec.failure_level(), FailureLevel::ResourceFailure);
    let reason = ec.resource(bad).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("panicked"), "{reason}");
}

#[test]
fn exhausted_retries_fail_the_resource() {
    let probe = Probe::new();
    let ec = fake_controller_with(&probe, fast_config().with_max_retries(3));

    let a = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let b = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(a, "run_time", -1.0).unwrap();
    ec.register_condition(&[b], ResourceAction::Start, &[a], ResourceState::Finished, None)
        .unwrap();

    ec.deploy().unwrap();

    assert_eq!(
        ec.wait_started(&[b]).unwrap(),
        WaitOutcome::Failed(vec![b])
    );
    let reason = ec.resource(b).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("3 retries"), "{reason}");
    assert_eq!(probe.count(b, "start"), 0);
    assert_eq!(ec.state(a).unwrap(), ResourceState::Started);
}

#[test]
fn max_wait_fails_the_resource() {
    let probe = Probe::new();
    let ec = fake_controller_with(
        &probe,
        fast_config().with_max_wait(Duration::from_millis(100)),
    );

    let a = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let b = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(a, "run_time", -1.0).unwrap();
    ec.register_condition(&[b], ResourceAction::Start, &[a], ResourceState::Finished, None)
        .unwrap();

    ec.deploy().unwrap();

    assert_eq!(
        ec.wait_started(&[b]).unwrap(),
        WaitOutcome::Failed(vec![b])
    );
    let reason = ec.resource(b).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("gave up after waiting"), "{reason}");
}

#[test]
fn deploy_discovers_and_provisions_first() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);
    let node = ec.register_resource(FakeNode::RTYPE).unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_deployed(&[node]).unwrap(), WaitOutcome::Reached);

    let hooks: Vec<_> = probe
        .calls()
        .into_iter()
        .filter(|c| c.guid == node)
        .map(|c| c.hook)
        .take(3)
        .collect();
    assert_eq!(hooks, ["discover", "provision", "deploy"]);

    let rm = ec.resource(node).unwrap();
    let core = rm.core();
    let discovered = core.reached_at(ResourceState::Discovered).unwrap();
    let provisioned = core.reached_at(ResourceState::Provisioned).unwrap();
    let ready = core.reached_at(ResourceState::Ready).unwrap();
    assert!(discovered <= provisioned && provisioned <= ready);
}

#[test]
fn direct_discover_and_provision_take_filters() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);
    let node = ec.register_resource(FakeNode::RTYPE).unwrap();

    let filters = Filters::from([("hostname".to_string(), AttrValue::from("picked"))]);
    assert_eq!(ec.discover(node, &filters).unwrap(), ResourceState::Discovered);
    assert_eq!(
        ec.get(node, "hostname").unwrap(),
        Some(AttrValue::from("picked"))
    );

    // Provisioning needs a discovered resource; discovery is not repeated.
    assert_eq!(ec.discover(node, &filters).unwrap(), ResourceState::Discovered);
    assert_eq!(ec.provision(node, &Filters::new()).unwrap(), ResourceState::Provisioned);
    assert_eq!(ec.provision(node, &Filters::new()).unwrap(), ResourceState::Provisioned);

    ec.deploy().unwrap();
    assert_eq!(ec.wait_deployed(&[node]).unwrap(), WaitOutcome::Reached);
    assert_eq!(probe.count(node, "discover"), 1);
    assert_eq!(probe.count(node, "provision"), 1);
    assert_eq!(probe.count(node, "deploy"), 1);
}

#[test]
fn failed_discovery_fails_the_deploy() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);
    let node = ec.register_resource(FakeNode::RTYPE).unwrap();
    ec.set(node, "fail_on", "discover").unwrap();

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_deployed(&[node]).unwrap(),
        WaitOutcome::Failed(vec![node])
    );
    let reason = ec.resource(node).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("discover failed"), "{reason}");
    assert_eq!(probe.count(node, "provision"), 0);
    assert_eq!(probe.count(node, "deploy"), 0);
    assert_eq!(ec.failure_level(), FailureLevel::ResourceFailure);
}

#[test]
fn direct_start_and_stop_ignore_conditions() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let a = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let b = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(a, "run_time", -1.0).unwrap();
    ec.set(b, "run_time", -1.0).unwrap();
    ec.register_condition(&[b], ResourceAction::Start, &[a], ResourceState::Stopped, None)
        .unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_started(&[a]).unwrap(), WaitOutcome::Reached);
    assert_eq!(ec.state(b).unwrap(), ResourceState::Ready);

    assert_eq!(ec.start(b).unwrap(), ResourceState::Started);
    assert_eq!(ec.stop(b).unwrap(), ResourceState::Stopped);
    assert_eq!(ec.stop(a).unwrap(), ResourceState::Stopped);

    // Starting again is a no-op: stopped resources are never restarted.
    assert_eq!(ec.start(b).unwrap(), ResourceState::Stopped);
    assert_eq!(probe.count(b, "start"), 1);
}

#[test]
fn explicit_fail_raises_the_failure_level() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);
    let node = ec.register_resource(FakeNode::RTYPE).unwrap();

    ec.fail(node, "operator gave up").unwrap();
    assert_eq!(ec.state(node).unwrap(), ResourceState::Failed);
    assert_eq!(ec.failure_level(), FailureLevel::ResourceFailure);
    assert!(matches!(
        ec.fail(9999, "nope"),
        Err(ExpctlError::UnknownResource(9999))
    ));
}

#[test]
fn registration_validates_types_guids_and_connections() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    assert!(matches!(
        ec.register_resource("fake::Toaster"),
        Err(ExpctlError::UnknownResourceType(_))
    ));

    let fixed = ec.register_resource_with_guid(FakeNode::RTYPE, 42).unwrap();
    assert_eq!(fixed, 42);
    assert!(matches!(
        ec.register_resource_with_guid(FakeNode::RTYPE, 42),
        Err(ExpctlError::DuplicateGuid(42))
    ));
    let next = ec.register_resource(FakeNode::RTYPE).unwrap();
    assert_ne!(next, 42);

    let chan = ec.register_resource(FakeChannel::RTYPE).unwrap();
    match ec.register_connection(chan, fixed) {
        Err(ExpctlError::InvalidConnection { from_type, to_type, .. }) => {
            assert_eq!(from_type, FakeChannel::RTYPE);
            assert_eq!(to_type, FakeNode::RTYPE);
        }
        other => panic!("expected InvalidConnection, got {other:?}"),
    }
    assert!(ec.register_connection(fixed, fixed).is_err());
    assert!(matches!(
        ec.register_connection(fixed, 777),
        Err(ExpctlError::UnknownResource(777))
    ));

    let iface = ec.register_resource(FakeInterface::RTYPE).unwrap();
    ec.register_connection(iface, chan).unwrap();
    let chan_rm = ec.resource(chan).unwrap();
    assert!(chan_rm.core().is_connected(iface));
    assert!(ec.resource(iface).unwrap().core().is_connected(chan));
    assert!(!chan_rm.core().is_connected(fixed));
}

#[test]
fn traces_are_served_once_enabled() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let traced = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let silent = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.register_trace(traced, "stdout").unwrap();
    assert!(matches!(
        ec.register_trace(traced, "pcap"),
        Err(ExpctlError::UnknownTrace { .. })
    ));

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_finished(&[traced, silent]).unwrap(),
        WaitOutcome::Reached
    );

    let expected = format!("hello from {traced}\n");
    match ec.trace(traced, "stdout", TraceQuery::All).unwrap() {
        TraceOutput::Content(bytes) => assert_eq!(bytes, expected.as_bytes()),
        other => panic!("unexpected trace output {other:?}"),
    }
    assert_eq!(
        ec.trace(traced, "stdout", TraceQuery::Size).unwrap(),
        TraceOutput::Size(expected.len() as u64)
    );
    assert_eq!(
        ec.trace(traced, "stdout", TraceQuery::Stream { block: 5, offset: 0 })
            .unwrap(),
        TraceOutput::Content(b"hello".to_vec())
    );

    assert!(matches!(
        ec.trace(silent, "stdout", TraceQuery::All),
        Err(ExpctlError::TraceUnavailable { .. })
    ));
    assert!(matches!(
        ec.trace(traced, "stderr", TraceQuery::All),
        Err(ExpctlError::UnknownTrace { .. })
    ));
}

#[test]
fn wait_times_out_on_long_running_applications() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let app = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(app, "run_time", -1.0).unwrap();
    ec.deploy().unwrap();

    let outcome = ec
        .wait(&[app], WaitFor::Finished, Some(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(matches!(
        ec.wait_started(&[4242]),
        Err(ExpctlError::UnknownResource(4242))
    ));
}

#[test]
fn exec_read_only_attributes_lock_after_deploy() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let app = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(app, "run_time", -1.0).unwrap();
    ec.deploy().unwrap();
    assert_eq!(ec.wait_started(&[app]).unwrap(), WaitOutcome::Reached);

    assert!(matches!(
        ec.set(app, "run_time", 1.0),
        Err(ExpctlError::ReadOnlyAttribute { .. })
    ));
    ec.set(app, "rate", 5i64).unwrap();
    assert_eq!(
        ec.get(app, "rate").unwrap(),
        Some(AttrValue::Integer(5))
    );
    let names: Vec<String> = ec
        .get_attributes(app)
        .unwrap()
        .iter()
        .map(|a| a.name().to_string())
        .collect();
    assert!(names.contains(&"run_time".to_string()));
}
