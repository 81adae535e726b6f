// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ExperimentFile, RawExperimentFile};
use crate::errors::Result;

/// Read and deserialize an experiment file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawExperimentFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawExperimentFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Read an experiment file and validate it.
///
/// Checks unknown references, self connections, duplicate guids, time
/// literals and cycles among START/STOP conditions. Resource types are
/// checked later against the driver factory
/// ([`validate_resource_types`](crate::config::validate_resource_types)).
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ExperimentFile> {
    let raw_config = load_from_path(&path)?;
    let config = ExperimentFile::try_from(raw_config)?;
    Ok(config)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("Experiment.toml")
}
