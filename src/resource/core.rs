// src/resource/core.rs

//! Per-resource bookkeeping shared by every driver.
//!
//! A driver embeds one [`ResourceCore`] and exposes it through
//! [`ResourceManager::core`](crate::resource::ResourceManager::core). The
//! core owns the lifecycle state (behind its own lock), the attribute
//! values, the connection set, the registered conditions and the trace
//! selection. Drivers never store references to other resources; they look
//! them up by guid through the controller handle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, warn};

use crate::dag::Condition;
use crate::errors::{ExpctlError, Result};
use crate::resource::attribute::{AttrValue, Attribute, Attributes};
use crate::resource::trace::TraceSpec;
use crate::types::{Guid, ResourceAction, ResourceState};

#[derive(Debug)]
struct Lifecycle {
    state: ResourceState,
    entered: HashMap<ResourceState, Instant>,
    failure: Option<String>,
    attempts: HashMap<ResourceAction, Attempts>,
}

/// Retry bookkeeping for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempts {
    /// When the action was first found unable to proceed.
    pub first: Instant,
    /// How many times it has been retried since.
    pub count: u32,
}

#[derive(Debug)]
struct TraceEntry {
    spec: TraceSpec,
    enabled: bool,
}

/// State, attributes and relations of one resource instance.
#[derive(Debug)]
pub struct ResourceCore {
    guid: Guid,
    rtype: String,
    lifecycle: Mutex<Lifecycle>,
    attributes: Mutex<Attributes>,
    connections: RwLock<BTreeSet<Guid>>,
    conditions: Mutex<HashMap<ResourceAction, Vec<Condition>>>,
    traces: Mutex<BTreeMap<String, TraceEntry>>,
    /// Held while a lifecycle action runs; see [`ResourceCore::try_begin`].
    busy: Mutex<()>,
}

impl ResourceCore {
    pub fn new(guid: Guid, rtype: &str, attributes: &[Attribute], traces: &[TraceSpec]) -> Self {
        let mut entered = HashMap::new();
        entered.insert(ResourceState::New, Instant::now());

        let traces = traces
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    TraceEntry {
                        spec: spec.clone(),
                        enabled: false,
                    },
                )
            })
            .collect();

        Self {
            guid,
            rtype: rtype.to_string(),
            lifecycle: Mutex::new(Lifecycle {
                state: ResourceState::New,
                entered,
                failure: None,
                attempts: HashMap::new(),
            }),
            attributes: Mutex::new(Attributes::from_schema(rtype, attributes)),
            connections: RwLock::new(BTreeSet::new()),
            conditions: Mutex::new(HashMap::new()),
            traces: Mutex::new(traces),
            busy: Mutex::new(()),
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn rtype(&self) -> &str {
        &self.rtype
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn state(&self) -> ResourceState {
        self.lifecycle().state
    }

    /// Reason recorded by the first transition to `Failed`.
    pub fn failure_reason(&self) -> Option<String> {
        self.lifecycle().failure.clone()
    }

    /// When the resource reached `state`.
    ///
    /// States that were skipped over (e.g. `Stopped` for a resource that
    /// went straight to `Finished`) report the earliest later state that
    /// counts as having reached them.
    pub fn reached_at(&self, state: ResourceState) -> Option<Instant> {
        let lc = self.lifecycle();
        if let Some(at) = lc.entered.get(&state) {
            return Some(*at);
        }
        lc.entered
            .iter()
            .filter(|(s, _)| s.reached(state))
            .map(|(_, at)| *at)
            .min()
    }

    /// Move to `to` if that is a legal transition. Returns whether the state
    /// changed.
    pub fn transition(&self, to: ResourceState) -> bool {
        let mut lc = self.lifecycle();
        let from = lc.state;
        if !from.can_transition(to) {
            if from != to {
                debug!(
                    guid = self.guid,
                    rtype = %self.rtype,
                    %from,
                    %to,
                    "ignoring illegal state transition"
                );
            }
            return false;
        }

        lc.state = to;
        lc.entered.insert(to, Instant::now());
        drop(lc);

        debug!(guid = self.guid, rtype = %self.rtype, %from, %to, "state changed");
        true
    }

    pub fn discover(&self) -> bool {
        self.transition(ResourceState::Discovered)
    }

    pub fn provision(&self) -> bool {
        self.transition(ResourceState::Provisioned)
    }

    pub fn set_ready(&self) -> bool {
        self.transition(ResourceState::Ready)
    }

    pub fn set_started(&self) -> bool {
        self.transition(ResourceState::Started)
    }

    pub fn set_stopped(&self) -> bool {
        self.transition(ResourceState::Stopped)
    }

    /// Record natural completion of a started resource.
    pub fn finish(&self) -> bool {
        self.transition(ResourceState::Finished)
    }

    pub fn set_released(&self) -> bool {
        self.transition(ResourceState::Released)
    }

    /// Move to `Failed`, keeping the first reason given. Returns `false` if
    /// the resource had already failed or was released.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let mut lc = self.lifecycle();
        if !lc.state.can_transition(ResourceState::Failed) {
            return false;
        }

        let from = lc.state;
        let reason = reason.into();
        lc.state = ResourceState::Failed;
        lc.entered.insert(ResourceState::Failed, Instant::now());
        lc.failure = Some(reason.clone());
        drop(lc);

        warn!(guid = self.guid, rtype = %self.rtype, %from, %reason, "resource failed");
        true
    }

    /// Record one more retry of `action` and return the running totals.
    pub fn note_attempt(&self, action: ResourceAction) -> Attempts {
        let mut lc = self.lifecycle();
        let entry = lc.attempts.entry(action).or_insert(Attempts {
            first: Instant::now(),
            count: 0,
        });
        entry.count += 1;
        *entry
    }

    pub fn clear_attempts(&self, action: ResourceAction) {
        self.lifecycle().attempts.remove(&action);
    }

    /// Claim the right to run a lifecycle action on this resource.
    ///
    /// Returns `None` if another worker is already running one; the caller
    /// should reschedule rather than wait.
    pub fn try_begin(&self) -> Option<MutexGuard<'_, ()>> {
        match self.busy.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Claim the action lock, waiting for a running action to finish.
    pub fn begin(&self) -> MutexGuard<'_, ()> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- attributes ------------------------------------------------------

    pub fn get(&self, name: &str) -> Result<Option<AttrValue>> {
        Ok(self.attributes().get(name)?.cloned())
    }

    /// User-facing set; honours the attribute flags against the current state.
    pub fn set(&self, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        let state = self.state();
        self.attributes().set(name, value.into(), state)
    }

    /// Driver-side set; flags are not checked.
    pub fn set_internal(&self, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        self.attributes().set_internal(name, value.into())
    }

    pub fn attr_string(&self, name: &str) -> Option<String> {
        self.attributes().string(name)
    }

    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        self.attributes().bool(name)
    }

    pub fn attr_integer(&self, name: &str) -> Option<i64> {
        self.attributes().integer(name)
    }

    pub fn attr_double(&self, name: &str) -> Option<f64> {
        self.attributes().double(name)
    }

    /// Snapshot of every attribute with its current value.
    pub fn attribute_list(&self) -> Vec<Attribute> {
        self.attributes().iter().cloned().collect()
    }

    // ---- connections -----------------------------------------------------

    pub fn connections(&self) -> Vec<Guid> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn is_connected(&self, guid: Guid) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&guid)
    }

    pub(crate) fn connect(&self, guid: Guid) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(guid);
    }

    // ---- conditions ------------------------------------------------------

    pub fn conditions(&self, action: ResourceAction) -> Vec<Condition> {
        self.conditions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&action)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn add_condition(&self, action: ResourceAction, condition: Condition) {
        self.conditions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(action)
            .or_default()
            .push(condition);
    }

    /// Drop `guards` from every `action` condition; conditions left without
    /// guards are removed.
    pub(crate) fn remove_guards(&self, action: ResourceAction, guards: &[Guid]) {
        let mut conditions = self.conditions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = conditions.get_mut(&action) {
            for cond in list.iter_mut() {
                cond.guards.retain(|g| !guards.contains(g));
            }
            list.retain(|cond| !cond.guards.is_empty());
        }
    }

    // ---- traces ----------------------------------------------------------

    pub fn enable_trace(&self, name: &str) -> Result<()> {
        let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = traces
            .get_mut(name)
            .ok_or_else(|| ExpctlError::UnknownTrace {
                rtype: self.rtype.clone(),
                name: name.to_string(),
            })?;
        entry.enabled = true;
        Ok(())
    }

    pub fn trace_enabled(&self, name: &str) -> bool {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|t| t.enabled)
    }

    pub fn has_trace(&self, name: &str) -> bool {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Declarations of the traces that have been enabled.
    pub fn enabled_traces(&self) -> Vec<TraceSpec> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| t.enabled)
            .map(|t| t.spec.clone())
            .collect()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attributes(&self) -> MutexGuard<'_, Attributes> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
