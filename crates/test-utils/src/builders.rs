#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use expctl::config::{
    ConditionSection, ControllerConfig, ControllerSection, ExperimentFile, RawExperimentFile,
    ResourceSection,
};
use expctl::types::{ResourceAction, ResourceState};

/// Controller settings with short intervals so tests finish quickly.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig::default()
        .with_worker_threads(4)
        .with_reschedule_delay(Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(10))
        .with_start_barrier_interval(Duration::from_millis(20))
        .with_root_dir(std::env::temp_dir().join("expctl-tests"))
}

/// Builder for `ExperimentFile` to simplify test setup.
pub struct ExperimentFileBuilder {
    config: RawExperimentFile,
}

impl ExperimentFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawExperimentFile {
                controller: ControllerSection {
                    worker_threads: 4,
                    reschedule_delay: "10ms".to_string(),
                    poll_interval: "10ms".to_string(),
                    start_barrier_interval: "20ms".to_string(),
                    ..ControllerSection::default()
                },
                resource: BTreeMap::new(),
                condition: Vec::new(),
            },
        }
    }

    pub fn with_controller(mut self, f: impl FnOnce(&mut ControllerSection)) -> Self {
        f(&mut self.config.controller);
        self
    }

    pub fn with_resource(mut self, name: &str, resource: ResourceSection) -> Self {
        self.config.resource.insert(name.to_string(), resource);
        self
    }

    pub fn with_condition(mut self, condition: ConditionSection) -> Self {
        self.config.condition.push(condition);
        self
    }

    pub fn raw(self) -> RawExperimentFile {
        self.config
    }

    pub fn build(self) -> ExperimentFile {
        ExperimentFile::try_from(self.config)
            .expect("Failed to build valid experiment from builder")
    }
}

impl Default for ExperimentFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ResourceSection`.
pub struct ResourceBuilder {
    resource: ResourceSection,
}

impl ResourceBuilder {
    pub fn new(rtype: &str) -> Self {
        Self {
            resource: ResourceSection {
                rtype: rtype.to_string(),
                guid: None,
                connect: Vec::new(),
                attributes: BTreeMap::new(),
                traces: Vec::new(),
            },
        }
    }

    pub fn guid(mut self, guid: u64) -> Self {
        self.resource.guid = Some(guid);
        self
    }

    pub fn connect(mut self, other: &str) -> Self {
        self.resource.connect.push(other.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<toml::Value>) -> Self {
        self.resource
            .attributes
            .insert(name.to_string(), value.into());
        self
    }

    pub fn trace(mut self, name: &str) -> Self {
        self.resource.traces.push(name.to_string());
        self
    }

    pub fn build(self) -> ResourceSection {
        self.resource
    }
}

/// A `[[condition]]` entry.
pub fn condition(
    targets: &[&str],
    action: ResourceAction,
    guards: &[&str],
    state: ResourceState,
    delay: Option<&str>,
) -> ConditionSection {
    ConditionSection {
        targets: targets.iter().map(|s| s.to_string()).collect(),
        action,
        guards: guards.iter().map(|s| s.to_string()).collect(),
        state,
        delay: delay.map(str::to_string),
    }
}
