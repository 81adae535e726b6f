// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the experiment controller and the handle passed to every callback
//!   ([`controller`])
//! - the scheduled deploy / start / stop steps with cooperative retry
//!   ([`lifecycle`])
//! - polling waits on aggregate state ([`waiting`])
//! - ordered teardown ([`shutdown`])
//! - repeated runs until a metric converges ([`runner`])

pub mod controller;
pub(crate) mod lifecycle;
pub mod runner;
pub mod shutdown;
pub mod waiting;

pub use controller::{ControllerHandle, ExperimentController};
pub use runner::{ExperimentRunner, RunSummary, normal_convergence};
pub use shutdown::ShutdownReport;
pub use waiting::{WaitFor, WaitOutcome};
