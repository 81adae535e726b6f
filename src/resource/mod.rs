// src/resource/mod.rs

//! Resource drivers and the contract the controller drives them through.
//!
//! A driver is a type implementing [`ResourceManager`] (the per-instance
//! lifecycle hooks) and [`ResourceType`] (the per-type schema and
//! constructor). Drivers are registered in a [`ResourceFactory`] that is
//! handed to the controller at construction.

pub mod attribute;
pub mod core;
pub mod factory;
pub mod trace;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::engine::ControllerHandle;
use crate::errors::{ExpctlError, Result};
use crate::types::{Guid, ResourceState};

pub use self::core::{Attempts, ResourceCore};
pub use attribute::{AttrType, AttrValue, Attribute, Attributes, Flags};
pub use factory::ResourceFactory;
pub use trace::{TraceOutput, TraceQuery, TraceSpec, read_trace_file};

/// Attribute constraints handed to `discover` and `provision`, e.g. a
/// hostname or architecture the backing host must match.
pub type Filters = BTreeMap<String, AttrValue>;

/// Outcome of a single invocation of a lifecycle hook.
///
/// Hooks never block waiting on other resources; they report how far they
/// got and the controller reschedules them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The action completed.
    Done,
    /// Dependencies are not there yet; retry after the configured backoff.
    Pending,
    /// Retry after this specific delay instead of the configured backoff.
    RetryAfter(Duration),
    /// The action can never complete (e.g. a dependency failed).
    Blocked(String),
}

impl Progress {
    pub fn is_done(&self) -> bool {
        matches!(self, Progress::Done)
    }
}

/// Lifecycle hooks of one resource instance.
///
/// Every hook receives the controller context. Hooks run on pool workers;
/// the controller never runs two hooks of the same resource concurrently.
/// State transitions for `Done` outcomes are applied by the controller, so
/// hooks only move the state themselves for completion detected later
/// ([`ResourceCore::finish`]).
///
/// A deploy runs `discover`, `provision` and `deploy` in turn; each
/// completed step is kept, so a retried deploy resumes where it stopped.
pub trait ResourceManager: Send + Sync + 'static {
    fn core(&self) -> &ResourceCore;

    fn guid(&self) -> Guid {
        self.core().guid()
    }

    fn rtype(&self) -> &str {
        self.core().rtype()
    }

    fn state(&self) -> ResourceState {
        self.core().state()
    }

    /// Whether this resource accepts a connection to `guid`. Checked on both
    /// ends when a connection is registered.
    fn valid_connection(&self, _ctx: &ControllerHandle, _guid: Guid) -> bool {
        true
    }

    /// Locate the backing resource. Moves NEW to DISCOVERED.
    fn discover(&self, _ctx: &ControllerHandle, _filters: &Filters) -> anyhow::Result<Progress> {
        Ok(Progress::Done)
    }

    /// Reserve what was discovered. Moves DISCOVERED to PROVISIONED.
    fn provision(&self, _ctx: &ControllerHandle, _filters: &Filters) -> anyhow::Result<Progress> {
        Ok(Progress::Done)
    }

    fn deploy(&self, _ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        Ok(Progress::Done)
    }

    fn start(&self, _ctx: &ControllerHandle) -> anyhow::Result<Progress> {
        Ok(Progress::Done)
    }

    fn stop(&self, _ctx: &ControllerHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Free whatever the resource holds. Also called for failed resources.
    fn release(&self, _ctx: &ControllerHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Retrieve trace `name`. Only called for declared traces.
    fn trace(&self, name: &str, _query: TraceQuery) -> Result<TraceOutput> {
        Err(ExpctlError::TraceUnavailable {
            name: name.to_string(),
            reason: format!("resource type {} does not collect traces", self.rtype()),
        })
    }
}

/// Per-type schema and constructor of a driver.
pub trait ResourceType: ResourceManager + Sized {
    /// Unique type name, e.g. `"linux::Application"`.
    const RTYPE: &'static str;

    /// One-line description shown by the CLI.
    fn help() -> &'static str {
        ""
    }

    fn attributes() -> Vec<Attribute> {
        Vec::new()
    }

    fn traces() -> Vec<TraceSpec> {
        Vec::new()
    }

    fn new(core: ResourceCore) -> Self;
}
