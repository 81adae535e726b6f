// src/config/validate.rs

use std::collections::BTreeSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{
    ConditionSpec, ControllerConfig, ControllerSection, ExperimentFile, RawExperimentFile,
    RetryPolicy,
};
use crate::errors::{ExpctlError, Result};
use crate::exec::{TimeSpec, parse_duration};
use crate::resource::ResourceFactory;
use crate::types::ResourceAction;

impl TryFrom<RawExperimentFile> for ExperimentFile {
    type Error = ExpctlError;

    fn try_from(raw: RawExperimentFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_resources(&raw)?;
        validate_connections(&raw)?;
        validate_guids(&raw)?;

        let controller = ControllerConfig::try_from(&raw.controller)?;
        let condition = validate_conditions(&raw)?;
        validate_condition_graph(&condition)?;

        Ok(ExperimentFile {
            controller,
            resource: raw.resource,
            condition,
        })
    }
}

impl TryFrom<&ControllerSection> for ControllerConfig {
    type Error = ExpctlError;

    fn try_from(section: &ControllerSection) -> std::result::Result<Self, Self::Error> {
        if section.worker_threads == 0 {
            return Err(ExpctlError::ConfigError(
                "[controller].worker_threads must be >= 1 (got 0)".to_string(),
            ));
        }
        if section.backoff_factor.is_nan() || section.backoff_factor < 1.0 {
            return Err(ExpctlError::ConfigError(format!(
                "[controller].backoff_factor must be >= 1.0 (got {})",
                section.backoff_factor
            )));
        }

        let delay = duration_field("reschedule_delay", &section.reschedule_delay)?;
        let max_delay = match &section.max_reschedule_delay {
            Some(s) => duration_field("max_reschedule_delay", s)?,
            None => delay,
        };
        let max_wait = section
            .max_wait
            .as_deref()
            .map(|s| duration_field("max_wait", s))
            .transpose()?;

        let defaults = ControllerConfig::default();

        Ok(ControllerConfig {
            exp_id: section.exp_id.clone(),
            worker_threads: section.worker_threads,
            retry: RetryPolicy {
                delay,
                max_delay: max_delay.max(delay),
                factor: section.backoff_factor,
                max_wait,
                max_retries: section.max_retries,
            },
            poll_interval: duration_field("poll_interval", &section.poll_interval)?,
            start_barrier_interval: duration_field(
                "start_barrier_interval",
                &section.start_barrier_interval,
            )?,
            root_dir: section.root_dir.clone().unwrap_or(defaults.root_dir),
        })
    }
}

/// Check every `type` against the drivers registered in `factory`, and
/// every configured attribute and trace against that type's schema.
pub fn validate_resource_types(cfg: &ExperimentFile, factory: &ResourceFactory) -> Result<()> {
    for (name, res) in cfg.resource.iter() {
        if !factory.contains(&res.rtype) {
            return Err(ExpctlError::ConfigError(format!(
                "resource '{}' has unknown type '{}' (known: {})",
                name,
                res.rtype,
                factory.resource_types().join(", ")
            )));
        }

        let schema = factory.attributes(&res.rtype)?;
        for attr in res.attributes.keys() {
            if !schema.iter().any(|a| a.name() == attr) {
                return Err(ExpctlError::UnknownAttribute {
                    rtype: res.rtype.clone(),
                    name: attr.clone(),
                });
            }
        }

        let traces = factory.traces(&res.rtype)?;
        for trace in res.traces.iter() {
            if !traces.iter().any(|t| &t.name == trace) {
                return Err(ExpctlError::UnknownTrace {
                    rtype: res.rtype.clone(),
                    name: trace.clone(),
                });
            }
        }
    }
    Ok(())
}

fn duration_field(field: &str, value: &str) -> Result<std::time::Duration> {
    parse_duration(value).map_err(|_| {
        ExpctlError::ConfigError(format!(
            "[controller].{field}: invalid time literal '{value}'"
        ))
    })
}

fn ensure_has_resources(cfg: &RawExperimentFile) -> Result<()> {
    if cfg.resource.is_empty() {
        return Err(ExpctlError::ConfigError(
            "experiment must contain at least one [resource.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_connections(cfg: &RawExperimentFile) -> Result<()> {
    for (name, res) in cfg.resource.iter() {
        for other in res.connect.iter() {
            if !cfg.resource.contains_key(other) {
                return Err(ExpctlError::ConfigError(format!(
                    "resource '{}' connects to unknown resource '{}'",
                    name, other
                )));
            }
            if other == name {
                return Err(ExpctlError::ConfigError(format!(
                    "resource '{}' cannot connect to itself",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_guids(cfg: &RawExperimentFile) -> Result<()> {
    let mut seen = BTreeSet::new();
    for res in cfg.resource.values() {
        if let Some(guid) = res.guid {
            if !seen.insert(guid) {
                return Err(ExpctlError::DuplicateGuid(guid));
            }
        }
    }
    Ok(())
}

fn validate_conditions(cfg: &RawExperimentFile) -> Result<Vec<ConditionSpec>> {
    let mut out = Vec::with_capacity(cfg.condition.len());

    for (idx, cond) in cfg.condition.iter().enumerate() {
        if cond.targets.is_empty() || cond.guards.is_empty() {
            return Err(ExpctlError::ConfigError(format!(
                "condition #{} needs at least one target and one guard",
                idx + 1
            )));
        }
        for name in cond.targets.iter().chain(cond.guards.iter()) {
            if !cfg.resource.contains_key(name) {
                return Err(ExpctlError::ConfigError(format!(
                    "condition #{} references unknown resource '{}'",
                    idx + 1,
                    name
                )));
            }
        }

        let delay = cond
            .delay
            .as_deref()
            .map(|s| s.parse::<TimeSpec>())
            .transpose()?;

        out.push(ConditionSpec {
            targets: cond.targets.clone(),
            action: cond.action,
            guards: cond.guards.clone(),
            state: cond.state,
            delay,
        });
    }

    Ok(out)
}

fn validate_condition_graph(conditions: &[ConditionSpec]) -> Result<()> {
    // Edge direction: guard -> target. Only START/STOP conditions are
    // ordered; deploy conditions may legitimately point both ways.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for cond in conditions
        .iter()
        .filter(|c| c.action != ResourceAction::Deploy)
    {
        for target in cond.targets.iter() {
            for guard in cond.guards.iter() {
                if guard == target {
                    return Err(ExpctlError::ConditionCycle(format!(
                        "resource '{}' waits on itself",
                        target
                    )));
                }
                graph.add_edge(guard.as_str(), target.as_str(), ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(ExpctlError::ConditionCycle(format!(
            "cycle detected in conditions involving resource '{}'",
            cycle.node_id()
        ))),
    }
}
