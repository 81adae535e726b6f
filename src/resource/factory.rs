// src/resource/factory.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{ExpctlError, Result};
use crate::resource::{Attribute, ResourceCore, ResourceManager, ResourceType, TraceSpec};
use crate::types::Guid;

type Constructor = Box<dyn Fn(ResourceCore) -> Arc<dyn ResourceManager> + Send + Sync>;

struct TypeEntry {
    help: &'static str,
    attributes: Vec<Attribute>,
    traces: Vec<TraceSpec>,
    create: Constructor,
}

/// Registry of driver types, keyed by type name.
///
/// Built once and passed to the controller; there is no process-wide type
/// table.
#[derive(Default)]
pub struct ResourceFactory {
    types: BTreeMap<&'static str, TypeEntry>,
}

impl ResourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `R` using its own constructor.
    pub fn register<R: ResourceType>(&mut self) -> &mut Self {
        self.register_with::<R>(R::new)
    }

    /// Register `R` with a custom constructor, e.g. one that injects shared
    /// state into each instance.
    pub fn register_with<R: ResourceType>(
        &mut self,
        create: impl Fn(ResourceCore) -> R + Send + Sync + 'static,
    ) -> &mut Self {
        self.types.insert(
            R::RTYPE,
            TypeEntry {
                help: R::help(),
                attributes: R::attributes(),
                traces: R::traces(),
                create: Box::new(move |core| Arc::new(create(core)) as Arc<dyn ResourceManager>),
            },
        );
        self
    }

    pub fn contains(&self, rtype: &str) -> bool {
        self.types.contains_key(rtype)
    }

    pub fn resource_types(&self) -> Vec<&'static str> {
        self.types.keys().copied().collect()
    }

    pub fn help(&self, rtype: &str) -> Result<&'static str> {
        Ok(self.entry(rtype)?.help)
    }

    /// Attribute schema (with defaults) of `rtype`.
    pub fn attributes(&self, rtype: &str) -> Result<&[Attribute]> {
        Ok(&self.entry(rtype)?.attributes)
    }

    pub fn traces(&self, rtype: &str) -> Result<&[TraceSpec]> {
        Ok(&self.entry(rtype)?.traces)
    }

    /// Instantiate a new resource of `rtype` with the given guid.
    pub fn create(&self, rtype: &str, guid: Guid) -> Result<Arc<dyn ResourceManager>> {
        let entry = self.entry(rtype)?;
        let core = ResourceCore::new(guid, rtype, &entry.attributes, &entry.traces);
        Ok((entry.create)(core))
    }

    fn entry(&self, rtype: &str) -> Result<&TypeEntry> {
        self.types
            .get(rtype)
            .ok_or_else(|| ExpctlError::UnknownResourceType(rtype.to_string()))
    }
}

impl fmt::Debug for ResourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceFactory")
            .field("types", &self.resource_types())
            .finish()
    }
}
