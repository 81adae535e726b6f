// tests/conditions.rs

mod common;
use crate::common::{PATIENCE, eventually, fake_controller};

use std::time::{Duration, Instant};

use expctl::dag::{Condition, ConditionGraph, Registry, Verdict, evaluate};
use expctl::engine::{WaitFor, WaitOutcome};
use expctl::errors::ExpctlError;
use expctl::exec::TimeSpec;
use expctl::resource::{AttrValue, ResourceType};
use expctl::types::{FailureLevel, ResourceAction, ResourceState};
use expctl_test_utils::fakes::{FakeApplication, FakeNode, Probe};

#[test]
fn start_condition_delay_is_measured_from_the_guard() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let server = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let client = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(server, "run_time", -1.0).unwrap();
    ec.register_condition(
        &[client],
        ResourceAction::Start,
        &[server],
        ResourceState::Started,
        Some(TimeSpec::After(Duration::from_millis(150))),
    )
    .unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_finished(&[client]).unwrap(), WaitOutcome::Reached);

    let server_started = ec
        .resource(server)
        .unwrap()
        .core()
        .reached_at(ResourceState::Started)
        .unwrap();
    let client_started = probe.last(client, "start").unwrap();
    assert!(
        client_started.duration_since(server_started) >= Duration::from_millis(150),
        "client started {:?} after server",
        client_started.duration_since(server_started)
    );
}

#[test]
fn oversized_start_delay_keeps_the_target_waiting() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let server = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let client = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(server, "run_time", -1.0).unwrap();
    let delay: TimeSpec = "4000000000000000h".parse().unwrap();
    ec.register_condition(
        &[client],
        ResourceAction::Start,
        &[server],
        ResourceState::Started,
        Some(delay),
    )
    .unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_started(&[server]).unwrap(), WaitOutcome::Reached);
    assert_eq!(
        ec.wait(
            &[client],
            WaitFor::State(ResourceState::Started),
            Some(Duration::from_millis(200)),
        )
        .unwrap(),
        WaitOutcome::TimedOut
    );
    assert_eq!(ec.state(client).unwrap(), ResourceState::Ready);
    assert_eq!(ec.failure_level(), FailureLevel::Ok);
    assert!(ec.shutdown().is_clean());
}

#[test]
fn stop_condition_stops_after_the_guard_finishes() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let worker = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let monitor = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(worker, "run_time", 0.05).unwrap();
    ec.set(monitor, "run_time", -1.0).unwrap();
    ec.register_condition(
        &[monitor],
        ResourceAction::Stop,
        &[worker],
        ResourceState::Finished,
        None,
    )
    .unwrap();

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_finished(&[worker, monitor]).unwrap(),
        WaitOutcome::Reached
    );
    assert_eq!(ec.state(worker).unwrap(), ResourceState::Finished);
    assert_eq!(ec.state(monitor).unwrap(), ResourceState::Stopped);
    assert_eq!(probe.count(monitor, "stop"), 1);

    let finished = ec
        .resource(worker)
        .unwrap()
        .core()
        .reached_at(ResourceState::Finished)
        .unwrap();
    assert!(probe.last(monitor, "stop").unwrap() >= finished);
}

#[test]
fn failed_guard_fails_the_waiting_resource() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let server = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let client = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(server, "fail_on", "start").unwrap();
    ec.register_condition(
        &[client],
        ResourceAction::Start,
        &[server],
        ResourceState::Started,
        None,
    )
    .unwrap();

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_started(&[client]).unwrap(),
        WaitOutcome::Failed(vec![client])
    );
    let reason = ec.resource(client).unwrap().core().failure_reason().unwrap();
    assert!(reason.contains("can never hold"), "{reason}");
    assert_eq!(probe.count(client, "start"), 0);
}

#[test]
fn waiting_for_failed_is_allowed() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let flaky = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let fallback = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(flaky, "fail_on", "start").unwrap();
    ec.register_condition(
        &[fallback],
        ResourceAction::Start,
        &[flaky],
        ResourceState::Failed,
        None,
    )
    .unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_finished(&[fallback]).unwrap(), WaitOutcome::Reached);
}

#[test]
fn deploy_condition_orders_deployment() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let first = ec.register_resource(FakeNode::RTYPE).unwrap();
    let second = ec.register_resource(FakeNode::RTYPE).unwrap();
    ec.set(first, "deploy_delay", 0.1).unwrap();
    ec.register_condition(
        &[second],
        ResourceAction::Deploy,
        &[first],
        ResourceState::Ready,
        None,
    )
    .unwrap();

    ec.deploy().unwrap();
    assert_eq!(
        ec.wait_deployed(&[first, second]).unwrap(),
        WaitOutcome::Reached
    );

    let first_ready = ec
        .resource(first)
        .unwrap()
        .core()
        .reached_at(ResourceState::Ready)
        .unwrap();
    let second_deploy = probe.last(second, "deploy").unwrap();
    assert!(second_deploy >= first_ready);
    assert_eq!(probe.count(second, "deploy"), 1);
}

#[test]
fn unregistering_a_guard_releases_the_gate() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let a = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let b = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(a, "run_time", -1.0).unwrap();
    ec.set(b, "run_time", -1.0).unwrap();
    ec.register_condition(&[b], ResourceAction::Start, &[a], ResourceState::Finished, None)
        .unwrap();

    ec.deploy().unwrap();
    assert_eq!(ec.wait_started(&[a]).unwrap(), WaitOutcome::Reached);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(ec.state(b).unwrap(), ResourceState::Ready);

    ec.unregister_condition(&[b], ResourceAction::Start, &[a])
        .unwrap();
    assert!(ec.resource(b).unwrap().core().conditions(ResourceAction::Start).is_empty());
    assert_eq!(ec.wait_started(&[b]).unwrap(), WaitOutcome::Reached);
}

#[test]
fn start_and_stop_cycles_are_rejected() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let a = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let b = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let c = ec.register_resource(FakeApplication::RTYPE).unwrap();

    ec.register_condition(&[b], ResourceAction::Start, &[a], ResourceState::Started, None)
        .unwrap();
    ec.register_condition(&[c], ResourceAction::Stop, &[b], ResourceState::Finished, None)
        .unwrap();

    // a waits on c, c on b, b on a.
    let err = ec
        .register_condition(&[a], ResourceAction::Start, &[c], ResourceState::Started, None)
        .unwrap_err();
    assert!(matches!(err, ExpctlError::ConditionCycle(_)), "{err:?}");
    assert!(ec.resource(a).unwrap().core().conditions(ResourceAction::Start).is_empty());

    assert!(matches!(
        ec.register_condition(&[a], ResourceAction::Stop, &[a], ResourceState::Finished, None),
        Err(ExpctlError::ConditionCycle(_))
    ));
    assert!(matches!(
        ec.register_condition(&[a], ResourceAction::Start, &[], ResourceState::Started, None),
        Err(ExpctlError::ConfigError(_))
    ));
    assert!(matches!(
        ec.register_condition(&[a], ResourceAction::Start, &[99], ResourceState::Started, None),
        Err(ExpctlError::UnknownResource(99))
    ));
}

#[test]
fn conditional_set_applies_once_the_guard_is_there() {
    let probe = Probe::new();
    let ec = fake_controller(&probe);

    let sender = ec.register_resource(FakeApplication::RTYPE).unwrap();
    let receiver = ec.register_resource(FakeApplication::RTYPE).unwrap();
    ec.set(sender, "run_time", 0.3).unwrap();
    ec.set(receiver, "run_time", -1.0).unwrap();

    ec.set_with_conditions("rate", 7i64, &[receiver], &[sender], ResourceState::Finished, None)
        .unwrap();
    ec.deploy().unwrap();

    assert_eq!(ec.wait_started(&[receiver]).unwrap(), WaitOutcome::Reached);
    assert_eq!(ec.get(receiver, "rate").unwrap(), None);

    assert!(eventually(PATIENCE, || {
        ec.get(receiver, "rate").unwrap() == Some(AttrValue::Integer(7))
    }));
    assert_eq!(ec.state(sender).unwrap(), ResourceState::Finished);
}

#[test]
fn release_waves_put_dependents_first() {
    let mut graph = ConditionGraph::default();
    // db <- api <- web, db <- worker
    graph.add_edge(1, 2);
    graph.add_edge(2, 3);
    graph.add_edge(1, 4);
    graph.add_node(5);

    let waves = graph.release_waves(&[1, 2, 3, 4, 5]);
    assert_eq!(waves, vec![vec![3, 4, 5], vec![2], vec![1]]);
    assert_eq!(graph.dependencies_of(2), vec![1]);
    let mut dependents = graph.dependents_of(1);
    dependents.sort();
    assert_eq!(dependents, vec![2, 4]);
    assert!(graph.find_cycle().is_none());

    graph.add_edge(3, 1);
    assert!(graph.find_cycle().is_some());
    assert_eq!(graph.release_waves(&[1, 2, 3]), vec![vec![1, 2, 3]]);
}

#[test]
fn evaluate_reports_unknown_guards_as_blocked() {
    let registry = Registry::new();
    let verdict = evaluate(
        &[Condition::new(vec![12], ResourceState::Ready)],
        &registry,
        Instant::now(),
    );
    assert!(matches!(verdict, Verdict::Blocked(_)));
    assert_eq!(evaluate(&[], &registry, Instant::now()), Verdict::Satisfied);
}
