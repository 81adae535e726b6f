// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod drivers;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod resource;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ExperimentFile, instantiate, load_and_validate, validate_resource_types};
use crate::drivers::LocalApplication;
use crate::engine::{WaitFor, WaitOutcome};
use crate::exec::parse_duration;
use crate::resource::{ResourceType, TraceOutput, TraceQuery};
use crate::types::{FailureLevel, ResourceState};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - experiment loading and validation
/// - the driver factory and controller
/// - deployment, waiting for the applications and Ctrl-C handling
/// - teardown and trace reporting
pub async fn run(args: CliArgs) -> Result<FailureLevel> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading experiment from {:?}", config_path))?;

    let factory = drivers::local::factory();
    validate_resource_types(&cfg, &factory)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(FailureLevel::Ok);
    }

    if let Some(workers) = args.workers {
        cfg.controller.worker_threads = workers.max(1);
    }
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;

    let experiment = Arc::new(instantiate(&cfg, factory)?);
    let ec = &experiment.controller;
    info!(exp_id = ec.exp_id(), resources = experiment.names.len(), "experiment loaded");

    ec.deploy()?;

    // Applications end on their own; without any, run until deployed.
    let apps = experiment.guids_of_type(LocalApplication::RTYPE);
    let (guids, target) = if apps.is_empty() {
        (ec.resources(), WaitFor::State(ResourceState::Ready))
    } else {
        (apps, WaitFor::Finished)
    };

    let outcome = tokio::select! {
        outcome = ec.wait_async(&guids, target, timeout) => Some(outcome?),
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                eprintln!("failed to listen for Ctrl+C: {e}");
            }
            None
        }
    };

    match &outcome {
        Some(WaitOutcome::Reached) => info!("experiment completed"),
        Some(WaitOutcome::Failed(guids)) => warn!(?guids, "resources failed"),
        Some(WaitOutcome::TimedOut) => warn!("timed out waiting for the experiment"),
        Some(WaitOutcome::Aborted) => warn!("experiment aborted"),
        None => info!("interrupted, shutting down"),
    }

    let report = {
        let experiment = Arc::clone(&experiment);
        tokio::task::spawn_blocking(move || experiment.controller.shutdown()).await?
    };
    for (guid, err) in report.errors.iter() {
        warn!(guid, error = %err, "teardown error");
    }
    debug!(?report, "shutdown report");

    print_traces(&experiment);

    let level = experiment.controller.failure_level();
    if level == FailureLevel::Ok && matches!(outcome, Some(WaitOutcome::TimedOut)) {
        return Ok(FailureLevel::ResourceFailure);
    }
    Ok(level)
}

/// Print the final state and the enabled traces of every resource.
fn print_traces(experiment: &config::Experiment) {
    let ec = &experiment.controller;
    for (name, &guid) in experiment.names.iter() {
        let state = ec
            .state(guid)
            .map(|s| s.to_string())
            .unwrap_or_else(|e| e.to_string());
        println!("{name} (guid {guid}): {state}");

        let Ok(rm) = ec.resource(guid) else { continue };
        for spec in rm.core().enabled_traces() {
            let trace = spec.name;
            match ec.trace(guid, &trace, TraceQuery::All) {
                Ok(TraceOutput::Content(bytes)) => {
                    println!("  [{trace}]");
                    for line in String::from_utf8_lossy(&bytes).lines() {
                        println!("    {line}");
                    }
                }
                Ok(other) => println!("  [{trace}] {other:?}"),
                Err(e) => println!("  [{trace}] unavailable: {e}"),
            }
        }
    }
}

/// Simple dry-run output: print resources, connections and conditions.
fn print_dry_run(cfg: &ExperimentFile) {
    println!("expctl dry-run");
    println!("  controller.worker_threads = {}", cfg.controller.worker_threads);
    println!(
        "  controller.reschedule_delay = {:?}",
        cfg.controller.retry.delay
    );
    println!("  controller.root_dir = {:?}", cfg.controller.root_dir);
    println!();

    println!("resources ({}):", cfg.resource.len());
    for (name, res) in cfg.resource.iter() {
        println!("  - {name}");
        println!("      type: {}", res.rtype);
        if let Some(guid) = res.guid {
            println!("      guid: {guid}");
        }
        if !res.connect.is_empty() {
            println!("      connect: {:?}", res.connect);
        }
        for (attr, value) in res.attributes.iter() {
            println!("      {attr} = {value}");
        }
        if !res.traces.is_empty() {
            println!("      traces: {:?}", res.traces);
        }
    }

    if !cfg.condition.is_empty() {
        println!();
        println!("conditions ({}):", cfg.condition.len());
        for cond in cfg.condition.iter() {
            let delay = cond
                .delay
                .map(|d| format!(" after {d}"))
                .unwrap_or_default();
            println!(
                "  - {} {:?} once {:?} {}{}",
                cond.action, cond.targets, cond.guards, cond.state, delay
            );
        }
    }

    debug!("dry-run complete (nothing deployed)");
}
