// src/errors.rs

//! Crate-wide error type and aliases.

use thiserror::Error;

use crate::types::{Guid, ResourceState};

#[derive(Error, Debug)]
pub enum ExpctlError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unknown resource: guid {0}")]
    UnknownResource(Guid),

    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("guid {0} is already assigned")]
    DuplicateGuid(Guid),

    #[error("Invalid connection between {from} ({from_type}) and {to} ({to_type})")]
    InvalidConnection {
        from: Guid,
        from_type: String,
        to: Guid,
        to_type: String,
    },

    #[error("Unknown attribute '{name}' for resource type {rtype}")]
    UnknownAttribute { rtype: String, name: String },

    #[error("Invalid value {value} for attribute '{name}'")]
    InvalidAttributeValue { name: String, value: String },

    #[error("Attribute '{name}' is read-only (resource state {state})")]
    ReadOnlyAttribute { name: String, state: ResourceState },

    #[error("Unknown trace '{name}' for resource type {rtype}")]
    UnknownTrace { rtype: String, name: String },

    #[error("Trace '{name}' is not available: {reason}")]
    TraceUnavailable { name: String, reason: String },

    #[error("Invalid time specification: {0}")]
    InvalidTimeSpec(String),

    #[error("Cycle detected in conditions: {0}")]
    ConditionCycle(String),

    #[error("Experiment controller has been shut down")]
    ControllerShutdown,

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ExpctlError>;
