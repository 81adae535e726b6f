// src/engine/controller.rs

//! The experiment controller and the context handed to every callback.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::dag::{Condition, ConditionGraph, ORDERED_ACTIONS, Registry};
use crate::engine::lifecycle::{self, Preparation};
use crate::engine::shutdown::ShutdownReport;
use crate::errors::{ExpctlError, Result};
use crate::exec::{
    Callback, HeapScheduler, Task, TaskId, TaskOutput, TaskRecord, TimeSpec, WorkerPool,
};
use crate::resource::{
    AttrValue, Attribute, Filters, Progress, ResourceFactory, ResourceManager, TraceOutput,
    TraceQuery,
};
use crate::types::{ControllerState, FailureLevel, Guid, ResourceAction, ResourceState};

pub(crate) struct Shared {
    exp_id: String,
    config: ControllerConfig,
    registry: Arc<Registry>,
    factory: Arc<ResourceFactory>,
    scheduler: HeapScheduler<Task>,
    tracked: Mutex<HashMap<TaskId, Arc<TaskRecord>>>,
    failure: AtomicU8,
    terminated: AtomicBool,
}

/// Cheap, cloneable view of a controller.
///
/// Every scheduled callback and every driver hook receives one. It gives
/// access to the registry, the scheduler and the failure level without
/// resources holding references to the controller or to each other.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
}

impl ControllerHandle {
    pub fn exp_id(&self) -> &str {
        &self.shared.exp_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn factory(&self) -> &ResourceFactory {
        &self.shared.factory
    }

    pub fn resource(&self, guid: Guid) -> Result<Arc<dyn ResourceManager>> {
        self.shared.registry.try_get(guid)
    }

    pub fn state(&self, guid: Guid) -> Result<ResourceState> {
        Ok(self.resource(guid)?.state())
    }

    /// Resources connected to `guid`, optionally restricted to one type.
    pub fn connected(&self, guid: Guid, rtype: Option<&str>) -> Vec<Arc<dyn ResourceManager>> {
        let Some(rm) = self.shared.registry.get(guid) else {
            return Vec::new();
        };
        rm.core()
            .connections()
            .into_iter()
            .filter_map(|other| self.shared.registry.get(other))
            .filter(|other| rtype.is_none_or(|t| other.rtype() == t))
            .collect()
    }

    /// Whether every `rtype` resource connected to `guid` has reached
    /// `state`. A failed collaborator blocks.
    pub fn await_connected(&self, guid: Guid, rtype: &str, state: ResourceState) -> Progress {
        let mut pending = false;
        for other in self.connected(guid, Some(rtype)) {
            let current = other.state();
            if current.is_failed() {
                return Progress::Blocked(format!("{} {} failed", rtype, other.guid()));
            }
            if !current.reached(state) {
                trace!(
                    guid,
                    other = other.guid(),
                    %current,
                    wanted = %state,
                    "collaborator not ready"
                );
                pending = true;
            }
        }
        if pending {
            Progress::Pending
        } else {
            Progress::Done
        }
    }

    /// Directory for artefacts of resource `guid`:
    /// `<root_dir>/<exp_id>/<guid>`.
    pub fn run_dir(&self, guid: Guid) -> PathBuf {
        self.shared
            .config
            .root_dir
            .join(&self.shared.exp_id)
            .join(guid.to_string())
    }

    /// Schedule an untracked callback.
    pub fn schedule<F>(&self, when: TimeSpec, label: impl Into<String>, f: F) -> Result<TaskId>
    where
        F: FnOnce(&ControllerHandle) -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_task(when, label, false, f)
    }

    /// Schedule a callback; when `track` is set its outcome stays
    /// retrievable through [`ExperimentController::get_task`].
    pub fn schedule_task<F, T>(
        &self,
        when: TimeSpec,
        label: impl Into<String>,
        track: bool,
        f: F,
    ) -> Result<TaskId>
    where
        F: FnOnce(&ControllerHandle) -> anyhow::Result<T> + Send + 'static,
        T: Any + Send,
    {
        let deadline = when.deadline_from(Instant::now());
        let label = label.into();
        let shared = &self.shared;

        shared.scheduler.schedule_with(deadline, |id| {
            let record = Arc::new(TaskRecord::new(id));
            if track {
                lock(&shared.tracked).insert(id, Arc::clone(&record));
            }
            let callback: Callback =
                Box::new(move |ctx| f(ctx).map(|value| Box::new(value) as TaskOutput));
            Task::new(label, callback, record)
        })
    }

    /// Cancel a queued task. Returns whether it was still queued.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.scheduler.remove(id).is_some()
    }

    /// Mark `guid` as failed and raise the failure level.
    pub fn fail(&self, guid: Guid, reason: impl Into<String>) {
        if let Some(rm) = self.shared.registry.get(guid) {
            if rm.core().fail(reason) {
                self.escalate(FailureLevel::ResourceFailure);
            }
        }
    }

    /// Raise the failure level to at least `level`.
    pub fn escalate(&self, level: FailureLevel) {
        let previous = self.shared.failure.fetch_max(level as u8, Ordering::SeqCst);
        if (level as u8) > previous {
            warn!(exp_id = %self.shared.exp_id, ?level, "failure level raised");
        }
    }

    pub fn failure_level(&self) -> FailureLevel {
        FailureLevel::from_u8(self.shared.failure.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        !self.shared.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn scheduler(&self) -> &HeapScheduler<Task> {
        &self.shared.scheduler
    }

    pub(crate) fn mark_terminated(&self) -> bool {
        !self.shared.terminated.swap(true, Ordering::SeqCst)
    }
}

/// Owner of one experiment: its resources, scheduler and worker pool.
///
/// Dropping the controller shuts it down if [`shutdown`](Self::shutdown) was
/// not called explicitly.
pub struct ExperimentController {
    pub(crate) handle: ControllerHandle,
    pub(crate) pool: Mutex<Option<WorkerPool>>,
    pub(crate) report: Mutex<Option<ShutdownReport>>,
}

impl ExperimentController {
    /// Controller with default settings.
    pub fn new(factory: ResourceFactory) -> Result<Self> {
        Self::with_config(ControllerConfig::default(), factory)
    }

    pub fn with_config(config: ControllerConfig, factory: ResourceFactory) -> Result<Self> {
        Self::with_registry(config, Arc::new(factory), Arc::new(Registry::new()))
    }

    /// Controller over an externally owned registry.
    pub fn with_registry(
        config: ControllerConfig,
        factory: Arc<ResourceFactory>,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let config = config.with_env_overrides();
        let exp_id = config.exp_id.clone().unwrap_or_else(generate_exp_id);
        let workers = config.worker_threads;

        let handle = ControllerHandle {
            shared: Arc::new(Shared {
                exp_id,
                config,
                registry,
                factory,
                scheduler: HeapScheduler::new(),
                tracked: Mutex::new(HashMap::new()),
                failure: AtomicU8::new(FailureLevel::Ok as u8),
                terminated: AtomicBool::new(false),
            }),
        };

        let pool = WorkerPool::spawn(workers, &handle)?;
        info!(exp_id = %handle.exp_id(), workers = pool.size(), "experiment controller started");

        Ok(Self {
            handle,
            pool: Mutex::new(Some(pool)),
            report: Mutex::new(None),
        })
    }

    pub fn exp_id(&self) -> &str {
        self.handle.exp_id()
    }

    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }

    pub fn config(&self) -> &ControllerConfig {
        self.handle.config()
    }

    pub fn failure_level(&self) -> FailureLevel {
        self.handle.failure_level()
    }

    pub fn controller_state(&self) -> ControllerState {
        if self.handle.is_running() {
            ControllerState::Running
        } else {
            ControllerState::Terminated
        }
    }

    /// True once the controller has been shut down.
    pub fn finished(&self) -> bool {
        !self.handle.is_running()
    }

    // ---- build phase -----------------------------------------------------

    /// Register a new resource of type `rtype` and return its guid.
    pub fn register_resource(&self, rtype: &str) -> Result<Guid> {
        self.register(rtype, None)
    }

    /// Register a resource under an explicit guid.
    pub fn register_resource_with_guid(&self, rtype: &str, guid: Guid) -> Result<Guid> {
        self.register(rtype, Some(guid))
    }

    fn register(&self, rtype: &str, requested: Option<Guid>) -> Result<Guid> {
        self.ensure_running()?;
        let factory = self.handle.factory();
        if !factory.contains(rtype) {
            return Err(ExpctlError::UnknownResourceType(rtype.to_string()));
        }

        let registry = self.handle.registry();
        let guid = registry.allocate(requested)?;
        let rm = factory.create(rtype, guid)?;
        registry.insert(rm);

        debug!(guid, rtype, "resource registered");
        Ok(guid)
    }

    /// Connect two resources. Both drivers must accept the connection.
    pub fn register_connection(&self, a: Guid, b: Guid) -> Result<()> {
        let ra = self.resource(a)?;
        let rb = self.resource(b)?;

        let invalid = || ExpctlError::InvalidConnection {
            from: a,
            from_type: ra.rtype().to_string(),
            to: b,
            to_type: rb.rtype().to_string(),
        };

        if a == b {
            return Err(invalid());
        }
        if !ra.valid_connection(&self.handle, b) || !rb.valid_connection(&self.handle, a) {
            return Err(invalid());
        }

        ra.core().connect(b);
        rb.core().connect(a);
        debug!(a, b, "connection registered");
        Ok(())
    }

    /// Gate `action` on every resource in `targets` until all `guards` have
    /// reached `state`, plus `delay` measured from the last of them.
    pub fn register_condition(
        &self,
        targets: &[Guid],
        action: ResourceAction,
        guards: &[Guid],
        state: ResourceState,
        delay: Option<TimeSpec>,
    ) -> Result<()> {
        if guards.is_empty() {
            return Err(ExpctlError::ConfigError(
                "a condition needs at least one guard".to_string(),
            ));
        }
        for guid in targets.iter().chain(guards) {
            self.resource(*guid)?;
        }

        if ORDERED_ACTIONS.contains(&action) {
            let registry = self.handle.registry();
            let mut graph = ConditionGraph::from_registry(registry, ORDERED_ACTIONS);
            for target in targets {
                for guard in guards {
                    graph.add_edge(*guard, *target);
                }
            }
            if let Some(guid) = graph.find_cycle() {
                return Err(ExpctlError::ConditionCycle(format!(
                    "{action} condition would make resource {guid} wait on itself"
                )));
            }
        }

        let condition = Condition {
            guards: guards.to_vec(),
            state,
            delay,
        };
        for target in targets {
            self.resource(*target)?
                .core()
                .add_condition(action, condition.clone());
        }

        debug!(?targets, ?guards, %action, %state, "condition registered");
        Ok(())
    }

    /// Remove `guards` from the `action` conditions of `targets`.
    pub fn unregister_condition(
        &self,
        targets: &[Guid],
        action: ResourceAction,
        guards: &[Guid],
    ) -> Result<()> {
        for target in targets {
            self.resource(*target)?.core().remove_guards(action, guards);
        }
        Ok(())
    }

    /// Enable a declared trace on a resource.
    pub fn register_trace(&self, guid: Guid, name: &str) -> Result<()> {
        self.resource(guid)?.core().enable_trace(name)
    }

    pub fn trace(&self, guid: Guid, name: &str, query: TraceQuery) -> Result<TraceOutput> {
        let rm = self.resource(guid)?;
        let core = rm.core();
        if !core.has_trace(name) {
            return Err(ExpctlError::UnknownTrace {
                rtype: core.rtype().to_string(),
                name: name.to_string(),
            });
        }
        if !core.trace_enabled(name) {
            return Err(ExpctlError::TraceUnavailable {
                name: name.to_string(),
                reason: "trace was not enabled".to_string(),
            });
        }
        rm.trace(name, query)
    }

    // ---- queries and direct actions --------------------------------------

    pub fn resource(&self, guid: Guid) -> Result<Arc<dyn ResourceManager>> {
        self.handle.resource(guid)
    }

    /// All registered guids.
    pub fn resources(&self) -> Vec<Guid> {
        self.handle.registry().guids()
    }

    pub fn state(&self, guid: Guid) -> Result<ResourceState> {
        self.handle.state(guid)
    }

    pub fn get(&self, guid: Guid, name: &str) -> Result<Option<AttrValue>> {
        self.resource(guid)?.core().get(name)
    }

    pub fn set(&self, guid: Guid, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        self.resource(guid)?.core().set(name, value)
    }

    pub fn get_attributes(&self, guid: Guid) -> Result<Vec<Attribute>> {
        Ok(self.resource(guid)?.core().attribute_list())
    }

    /// Run the driver's discovery on a NEW resource now. Returns the
    /// resulting state; a driver asking to retry leaves it NEW.
    pub fn discover(&self, guid: Guid, filters: &Filters) -> Result<ResourceState> {
        self.prepare(guid, Preparation::Discover, filters)
    }

    /// Run the driver's provisioning on a DISCOVERED resource now.
    pub fn provision(&self, guid: Guid, filters: &Filters) -> Result<ResourceState> {
        self.prepare(guid, Preparation::Provision, filters)
    }

    fn prepare(&self, guid: Guid, step: Preparation, filters: &Filters) -> Result<ResourceState> {
        self.ensure_running()?;
        let rm = self.resource(guid)?;
        let _busy = rm.core().begin();
        if Preparation::pending_at(rm.state()) == Some(step) {
            let progress = lifecycle::prepare_now(&self.handle, &rm, step, filters);
            debug!(guid, ?step, ?progress, "direct preparation");
        }
        Ok(rm.state())
    }

    /// Start a READY resource now, ignoring its conditions. Returns the
    /// resulting state.
    pub fn start(&self, guid: Guid) -> Result<ResourceState> {
        let rm = self.resource(guid)?;
        let _busy = rm.core().begin();
        if rm.state() == ResourceState::Ready {
            lifecycle::start_now(&self.handle, &rm);
        }
        Ok(rm.state())
    }

    /// Stop a STARTED resource now, ignoring its conditions. Returns the
    /// resulting state.
    pub fn stop(&self, guid: Guid) -> Result<ResourceState> {
        let rm = self.resource(guid)?;
        let _busy = rm.core().begin();
        if let Err(reason) = lifecycle::stop_now(&self.handle, &rm) {
            debug!(guid, %reason, "direct stop failed");
        }
        Ok(rm.state())
    }

    /// Force a resource into FAILED.
    pub fn fail(&self, guid: Guid, reason: &str) -> Result<()> {
        self.resource(guid)?;
        self.handle.fail(guid, reason);
        Ok(())
    }

    // ---- scheduling ------------------------------------------------------

    /// Run `f` on a worker at `when`. With `track`, the outcome can be
    /// fetched with [`get_task`](Self::get_task).
    pub fn schedule<F, T>(&self, when: TimeSpec, track: bool, f: F) -> Result<TaskId>
    where
        F: FnOnce(&ControllerHandle) -> anyhow::Result<T> + Send + 'static,
        T: Any + Send,
    {
        self.handle.schedule_task(when, "user task", track, f)
    }

    /// Record of a tracked task.
    pub fn get_task(&self, id: TaskId) -> Option<Arc<TaskRecord>> {
        lock(&self.handle.shared.tracked).get(&id).cloned()
    }

    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.handle.cancel(id)
    }

    // ---- run phase -------------------------------------------------------

    /// Deploy every registered resource, starting them once all are READY.
    pub fn deploy(&self) -> Result<()> {
        let guids = self.resources();
        self.deploy_group(&guids, true)
    }

    /// Deploy `group`.
    ///
    /// With `wait_all_ready`, a barrier task holds back all starts until
    /// every resource in the group is READY (or FAILED). Otherwise each
    /// resource starts as soon as it is READY and its conditions hold.
    pub fn deploy_group(&self, group: &[Guid], wait_all_ready: bool) -> Result<()> {
        self.ensure_running()?;
        let resources = group
            .iter()
            .map(|guid| self.resource(*guid))
            .collect::<Result<Vec<_>>>()?;

        for rm in resources.iter() {
            let guid = rm.guid();
            lifecycle::schedule_action(&self.handle, guid, ResourceAction::Deploy, TimeSpec::Now)?;
        }

        if wait_all_ready {
            lifecycle::schedule_start_barrier(
                &self.handle,
                group.to_vec(),
                TimeSpec::After(self.config().start_barrier_interval),
            )?;
        } else {
            for rm in resources.iter() {
                let guid = rm.guid();
                lifecycle::schedule_action(&self.handle, guid, ResourceAction::Start, TimeSpec::Now)?;
            }
        }

        for rm in resources.iter() {
            if !rm.core().conditions(ResourceAction::Stop).is_empty() {
                let guid = rm.guid();
                lifecycle::schedule_action(&self.handle, guid, ResourceAction::Stop, TimeSpec::Now)?;
            }
        }

        info!(
            exp_id = %self.exp_id(),
            resources = group.len(),
            wait_all_ready,
            "deploy scheduled"
        );
        Ok(())
    }

    /// Schedule a start that waits for READY and the START conditions.
    pub fn start_with_conditions(&self, guid: Guid) -> Result<TaskId> {
        self.resource(guid)?;
        lifecycle::schedule_action(&self.handle, guid, ResourceAction::Start, TimeSpec::Now)
    }

    /// Schedule a stop that waits for STARTED and the STOP conditions.
    pub fn stop_with_conditions(&self, guid: Guid) -> Result<TaskId> {
        self.resource(guid)?;
        lifecycle::schedule_action(&self.handle, guid, ResourceAction::Stop, TimeSpec::Now)
    }

    /// Set attribute `name` on every target once it is STARTED and all
    /// `guards` have reached `state` (plus `delay`).
    pub fn set_with_conditions(
        &self,
        name: &str,
        value: impl Into<AttrValue>,
        targets: &[Guid],
        guards: &[Guid],
        state: ResourceState,
        delay: Option<TimeSpec>,
    ) -> Result<()> {
        for guid in targets.iter().chain(guards) {
            self.resource(*guid)?;
        }

        let value = value.into();
        let condition = Condition {
            guards: guards.to_vec(),
            state,
            delay,
        };
        for target in targets {
            lifecycle::schedule_set(
                &self.handle,
                *target,
                lifecycle::PendingSet {
                    name: name.to_string(),
                    value: value.clone(),
                    condition: condition.clone(),
                },
                TimeSpec::Now,
            )?;
        }
        Ok(())
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.handle.is_running() {
            Ok(())
        } else {
            Err(ExpctlError::ControllerShutdown)
        }
    }
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("exp_id", &self.exp_id())
            .field("resources", &self.handle.registry().len())
            .field("failure_level", &self.failure_level())
            .field("state", &self.controller_state())
            .finish()
    }
}

fn generate_exp_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("exp-{:x}", nanos ^ ((process::id() as u64) << 32))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
