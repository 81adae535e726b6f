#![allow(dead_code)]

use std::time::Duration;

use expctl::config::ControllerConfig;
use expctl::engine::ExperimentController;
use expctl_test_utils::builders::fast_config;
use expctl_test_utils::fakes::{Probe, fake_factory};

pub use expctl_test_utils::{eventually, init_tracing};

/// How long scenario tests wait for anything to happen.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// A controller over the fake drivers with fast polling.
pub fn fake_controller(probe: &Probe) -> ExperimentController {
    fake_controller_with(probe, fast_config())
}

pub fn fake_controller_with(probe: &Probe, config: ControllerConfig) -> ExperimentController {
    init_tracing();
    ExperimentController::with_config(config, fake_factory(probe))
        .expect("controller should start")
}
