// src/config/instantiate.rs

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::model::ExperimentFile;
use crate::config::validate::validate_resource_types;
use crate::engine::ExperimentController;
use crate::errors::{ExpctlError, Result};
use crate::resource::{AttrValue, ResourceFactory};
use crate::types::Guid;

/// A controller populated from an experiment description, plus the
/// name -> guid mapping of its resources.
#[derive(Debug)]
pub struct Experiment {
    pub controller: ExperimentController,
    pub names: BTreeMap<String, Guid>,
}

impl Experiment {
    pub fn guid(&self, name: &str) -> Option<Guid> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, guid: Guid) -> Option<&str> {
        self.names
            .iter()
            .find(|(_, g)| **g == guid)
            .map(|(name, _)| name.as_str())
    }

    /// Guids of all resources of type `rtype`.
    pub fn guids_of_type(&self, rtype: &str) -> Vec<Guid> {
        self.names
            .values()
            .copied()
            .filter(|guid| {
                self.controller
                    .resource(*guid)
                    .is_ok_and(|rm| rm.rtype() == rtype)
            })
            .collect()
    }
}

/// Build a controller for `cfg`: register resources, set attributes,
/// enable traces, connect resources and register conditions.
pub fn instantiate(cfg: &ExperimentFile, factory: ResourceFactory) -> Result<Experiment> {
    validate_resource_types(cfg, &factory)?;

    let controller = ExperimentController::with_config(cfg.controller.clone(), factory)?;
    let mut names = BTreeMap::new();

    // Explicit guids first so automatic ones never collide with them.
    let (explicit, automatic): (Vec<_>, Vec<_>) =
        cfg.resource.iter().partition(|(_, res)| res.guid.is_some());

    for (name, res) in explicit.into_iter().chain(automatic) {
        let guid = match res.guid {
            Some(guid) => controller.register_resource_with_guid(&res.rtype, guid)?,
            None => controller.register_resource(&res.rtype)?,
        };
        debug!(name = %name, guid, rtype = %res.rtype, "resource instantiated");
        names.insert(name.clone(), guid);
    }

    for (name, res) in cfg.resource.iter() {
        let guid = names[name];
        for (attr, value) in res.attributes.iter() {
            controller.set(guid, attr, toml_attr_value(attr, value)?)?;
        }
        for trace in res.traces.iter() {
            controller.register_trace(guid, trace)?;
        }
    }

    let mut connected = BTreeSet::new();
    for (name, res) in cfg.resource.iter() {
        let a = names[name];
        for other in res.connect.iter() {
            let b = names[other];
            if connected.insert((a.min(b), a.max(b))) {
                controller.register_connection(a, b)?;
            }
        }
    }

    for cond in cfg.condition.iter() {
        let targets: Vec<Guid> = cond.targets.iter().map(|n| names[n]).collect();
        let guards: Vec<Guid> = cond.guards.iter().map(|n| names[n]).collect();
        controller.register_condition(&targets, cond.action, &guards, cond.state, cond.delay)?;
    }

    Ok(Experiment { controller, names })
}

fn toml_attr_value(name: &str, value: &toml::Value) -> Result<AttrValue> {
    match value {
        toml::Value::String(s) => Ok(AttrValue::String(s.clone())),
        toml::Value::Integer(i) => Ok(AttrValue::Integer(*i)),
        toml::Value::Float(f) => Ok(AttrValue::Double(*f)),
        toml::Value::Boolean(b) => Ok(AttrValue::Bool(*b)),
        other => Err(ExpctlError::InvalidAttributeValue {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}
