// src/config/mod.rs

//! Controller settings and TOML experiment descriptions.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a description from disk (`loader.rs`).
//! - Validate references, time literals and the condition graph
//!   (`validate.rs`).
//! - Turn a validated description into a populated controller
//!   (`instantiate.rs`).

pub mod instantiate;
pub mod loader;
pub mod model;
pub mod validate;

pub use instantiate::{Experiment, instantiate};
pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ConditionSection, ConditionSpec, ControllerConfig, ControllerSection, ExperimentFile,
    RawExperimentFile, ResourceSection, RetryPolicy, WORKERS_ENV,
};
pub use validate::validate_resource_types;
