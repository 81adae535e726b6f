// src/engine/lifecycle.rs

//! Scheduled lifecycle steps with cooperative retry.
//!
//! Every step is a short task: it checks whether the resource can act,
//! invokes the driver hook at most once and either applies the resulting
//! transition or reschedules itself. No step ever blocks a worker waiting
//! for another resource.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::dag::{self, Condition, Verdict};
use crate::engine::ControllerHandle;
use crate::errors::Result;
use crate::exec::pool::panic_message;
use crate::exec::{TaskId, TimeSpec};
use crate::resource::{AttrValue, Filters, Progress, ResourceManager};
use crate::types::{Guid, ResourceAction, ResourceState};

/// Queue `action` for `guid` at `when`.
pub(crate) fn schedule_action(
    ctx: &ControllerHandle,
    guid: Guid,
    action: ResourceAction,
    when: TimeSpec,
) -> Result<TaskId> {
    ctx.schedule(when, format!("{action} guid={guid}"), move |ctx| {
        let rm = ctx.resource(guid)?;
        match action {
            ResourceAction::Deploy => deploy_step(ctx, &rm),
            ResourceAction::Start => start_step(ctx, &rm),
            ResourceAction::Stop => stop_step(ctx, &rm),
        }
        Ok(())
    })
}

fn reschedule(ctx: &ControllerHandle, guid: Guid, action: ResourceAction, delay: Duration) {
    if let Err(err) = schedule_action(ctx, guid, action, TimeSpec::from(delay)) {
        trace!(guid, %action, error = %err, "not rescheduled");
    }
}

/// Count one more retry of `action` and reschedule it, or fail the
/// resource if the retry policy is exhausted.
fn retry(
    ctx: &ControllerHandle,
    rm: &Arc<dyn ResourceManager>,
    action: ResourceAction,
    hint: Option<Duration>,
) {
    let core = rm.core();
    let policy = &ctx.config().retry;
    let attempts = core.note_attempt(action);

    if let Some(reason) = policy.exhausted(attempts, Instant::now()) {
        ctx.fail(core.guid(), format!("{action} did not complete: {reason}"));
        return;
    }

    let delay = hint.unwrap_or_else(|| policy.delay_for(attempts.count));
    debug!(
        guid = core.guid(),
        rtype = %core.rtype(),
        %action,
        attempt = attempts.count,
        delay_ms = delay.as_millis() as u64,
        "not ready, rescheduling"
    );
    reschedule(ctx, core.guid(), action, delay);
}

/// Evaluate the `action` conditions of `rm`. Returns `true` if the action
/// may run now; otherwise the step has already been rescheduled (or the
/// resource failed).
fn gate(ctx: &ControllerHandle, rm: &Arc<dyn ResourceManager>, action: ResourceAction) -> bool {
    let core = rm.core();
    let conditions = core.conditions(action);
    if conditions.is_empty() {
        return true;
    }

    match dag::evaluate(&conditions, ctx.registry(), Instant::now()) {
        Verdict::Satisfied => true,
        Verdict::Unmet => {
            retry(ctx, rm, action, None);
            false
        }
        Verdict::Delay(wait) => {
            trace!(
                guid = core.guid(),
                %action,
                wait_ms = wait.as_millis() as u64,
                "condition delay"
            );
            reschedule(ctx, core.guid(), action, wait);
            false
        }
        Verdict::Blocked(reason) => {
            ctx.fail(core.guid(), format!("{action} condition can never hold: {reason}"));
            false
        }
    }
}

/// Run a driver hook, turning errors and panics into a failure reason.
fn invoke<T>(f: impl FnOnce() -> anyhow::Result<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(format!("driver panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn deploy_step(ctx: &ControllerHandle, rm: &Arc<dyn ResourceManager>) {
    let core = rm.core();
    let state = core.state();
    if state.is_failed() || state.reached(ResourceState::Ready) {
        return;
    }

    let Some(_busy) = core.try_begin() else {
        reschedule(ctx, core.guid(), ResourceAction::Deploy, ctx.config().retry.delay);
        return;
    };
    if !gate(ctx, rm, ResourceAction::Deploy) {
        return;
    }

    let filters = Filters::new();
    while let Some(step) = Preparation::pending_at(core.state()) {
        match prepare_now(ctx, rm, step, &filters) {
            Progress::Done => continue,
            Progress::Pending => retry(ctx, rm, ResourceAction::Deploy, None),
            Progress::RetryAfter(delay) => retry(ctx, rm, ResourceAction::Deploy, Some(delay)),
            Progress::Blocked(_) => {}
        }
        return;
    }

    match invoke(|| rm.deploy(ctx)) {
        Ok(Progress::Done) => {
            core.clear_attempts(ResourceAction::Deploy);
            if core.set_ready() {
                info!(guid = core.guid(), rtype = %core.rtype(), "resource ready");
            }
        }
        Ok(Progress::Pending) => retry(ctx, rm, ResourceAction::Deploy, None),
        Ok(Progress::RetryAfter(delay)) => retry(ctx, rm, ResourceAction::Deploy, Some(delay)),
        Ok(Progress::Blocked(reason)) | Err(reason) => {
            ctx.fail(core.guid(), format!("deploy failed: {reason}"));
        }
    }
}

/// The steps between NEW and the driver's `deploy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Preparation {
    Discover,
    Provision,
}

impl Preparation {
    /// The step a resource in `state` still has to take, if any.
    pub(crate) fn pending_at(state: ResourceState) -> Option<Self> {
        match state {
            ResourceState::New => Some(Preparation::Discover),
            ResourceState::Discovered => Some(Preparation::Provision),
            _ => None,
        }
    }

    fn reaches(self) -> ResourceState {
        match self {
            Preparation::Discover => ResourceState::Discovered,
            Preparation::Provision => ResourceState::Provisioned,
        }
    }
}

/// Invoke the driver's `discover` or `provision`. The caller holds the
/// resource's action lock. `Done` means the state moved on; `Blocked`
/// means the resource is now FAILED.
pub(crate) fn prepare_now(
    ctx: &ControllerHandle,
    rm: &Arc<dyn ResourceManager>,
    step: Preparation,
    filters: &Filters,
) -> Progress {
    let core = rm.core();
    let outcome = match step {
        Preparation::Discover => invoke(|| rm.discover(ctx, filters)),
        Preparation::Provision => invoke(|| rm.provision(ctx, filters)),
    };
    let name = match step {
        Preparation::Discover => "discover",
        Preparation::Provision => "provision",
    };

    match outcome {
        Ok(Progress::Done) if core.transition(step.reaches()) => {
            debug!(guid = core.guid(), rtype = %core.rtype(), "{name} done");
            Progress::Done
        }
        Ok(Progress::Done) => Progress::Blocked(format!("resource is {} after {name}", core.state())),
        Ok(Progress::Blocked(reason)) | Err(reason) => {
            let reason = format!("{name} failed: {reason}");
            ctx.fail(core.guid(), reason.clone());
            Progress::Blocked(reason)
        }
        Ok(progress) => progress,
    }
}

fn start_step(ctx: &ControllerHandle, rm: &Arc<dyn ResourceManager>) {
    let core = rm.core();
    let state = core.state();
    if state.is_failed() || state.reached(ResourceState::Started) {
        return;
    }
    if !state.reached(ResourceState::Ready) {
        reschedule(ctx, core.guid(), ResourceAction::Start, ctx.config().retry.delay);
        return;
    }

    let Some(_busy) = core.try_begin() else {
        reschedule(ctx, core.guid(), ResourceAction::Start, ctx.config().retry.delay);
        return;
    };
    if !gate(ctx, rm, ResourceAction::Start) {
        return;
    }

    start_now(ctx, rm);
}

/// Invoke the driver's `start` on a READY resource. The caller holds the
/// resource's action lock.
pub(crate) fn start_now(ctx: &ControllerHandle, rm: &Arc<dyn ResourceManager>) {
    let core = rm.core();
    if core.state() != ResourceState::Ready {
        return;
    }

    match invoke(|| rm.start(ctx)) {
        Ok(Progress::Done) => {
            core.clear_attempts(ResourceAction::Start);
            if core.set_started() {
                info!(guid = core.guid(), rtype = %core.rtype(), "resource started");
            }
        }
        Ok(Progress::Pending) => retry(ctx, rm, ResourceAction::Start, None),
        Ok(Progress::RetryAfter(delay)) => retry(ctx, rm, ResourceAction::Start, Some(delay)),
        Ok(Progress::Blocked(reason)) | Err(reason) => {
            ctx.fail(core.guid(), format!("start failed: {reason}"));
        }
    }
}

fn stop_step(ctx: &ControllerHandle, rm: &Arc<dyn ResourceManager>) {
    let core = rm.core();
    let state = core.state();
    if state.is_failed() || state.is_finished() {
        return;
    }
    if !state.reached(ResourceState::Started) {
        reschedule(ctx, core.guid(), ResourceAction::Stop, ctx.config().retry.delay);
        return;
    }

    let Some(_busy) = core.try_begin() else {
        reschedule(ctx, core.guid(), ResourceAction::Stop, ctx.config().retry.delay);
        return;
    };
    if !gate(ctx, rm, ResourceAction::Stop) {
        return;
    }

    // Failures are recorded on the resource by stop_now.
    let _ = stop_now(ctx, rm);
}

/// Invoke the driver's `stop` on a STARTED resource. The caller holds the
/// resource's action lock. Returns whether the resource was stopped.
pub(crate) fn stop_now(
    ctx: &ControllerHandle,
    rm: &Arc<dyn ResourceManager>,
) -> std::result::Result<bool, String> {
    let core = rm.core();
    if core.state() != ResourceState::Started {
        return Ok(false);
    }

    match invoke(|| rm.stop(ctx)) {
        Ok(()) => {
            if core.set_stopped() {
                info!(guid = core.guid(), rtype = %core.rtype(), "resource stopped");
            }
            Ok(true)
        }
        Err(reason) => {
            ctx.fail(core.guid(), format!("stop failed: {reason}"));
            Err(reason)
        }
    }
}

/// Invoke the driver's `release`. Failed resources keep their state.
pub(crate) fn release_now(
    ctx: &ControllerHandle,
    rm: &Arc<dyn ResourceManager>,
) -> std::result::Result<bool, String> {
    let core = rm.core();
    if core.state() == ResourceState::Released {
        return Ok(false);
    }

    match invoke(|| rm.release(ctx)) {
        Ok(()) => {
            let released = core.set_released();
            if released {
                debug!(guid = core.guid(), rtype = %core.rtype(), "resource released");
            }
            Ok(released)
        }
        Err(reason) => {
            ctx.fail(core.guid(), format!("release failed: {reason}"));
            Err(reason)
        }
    }
}

/// An attribute update waiting for its condition.
#[derive(Debug, Clone)]
pub(crate) struct PendingSet {
    pub name: String,
    pub value: AttrValue,
    pub condition: Condition,
}

pub(crate) fn schedule_set(
    ctx: &ControllerHandle,
    guid: Guid,
    pending: PendingSet,
    when: TimeSpec,
) -> Result<TaskId> {
    let label = format!("set {} guid={guid}", pending.name);
    ctx.schedule(when, label, move |ctx| {
        set_step(ctx, guid, pending);
        Ok(())
    })
}

fn set_step(ctx: &ControllerHandle, guid: Guid, pending: PendingSet) {
    let Ok(rm) = ctx.resource(guid) else {
        return;
    };
    let core = rm.core();
    let state = core.state();
    let delay = ctx.config().retry.delay;

    if state.is_failed() || state.is_finished() {
        debug!(guid, attr = %pending.name, %state, "dropping conditional set");
        return;
    }

    let wait = if state != ResourceState::Started {
        Some(delay)
    } else {
        let conditions = std::slice::from_ref(&pending.condition);
        match dag::evaluate(conditions, ctx.registry(), Instant::now()) {
            Verdict::Satisfied => None,
            Verdict::Unmet => Some(delay),
            Verdict::Delay(wait) => Some(wait),
            Verdict::Blocked(reason) => {
                warn!(guid, attr = %pending.name, %reason, "conditional set abandoned");
                return;
            }
        }
    };

    if let Some(wait) = wait {
        if let Err(err) = schedule_set(ctx, guid, pending, TimeSpec::from(wait)) {
            trace!(guid, error = %err, "conditional set not rescheduled");
        }
        return;
    }

    let PendingSet { name, value, .. } = pending;
    match core.set(&name, value) {
        Ok(()) => debug!(guid, attr = %name, "conditional set applied"),
        Err(err) => warn!(guid, attr = %name, error = %err, "conditional set rejected"),
    }
}

/// Queue a barrier that starts every healthy resource of `group` once all
/// of them are READY or FAILED.
pub(crate) fn schedule_start_barrier(
    ctx: &ControllerHandle,
    group: Vec<Guid>,
    when: TimeSpec,
) -> Result<TaskId> {
    ctx.schedule(when, "start barrier", move |ctx| start_barrier(ctx, group))
}

fn start_barrier(ctx: &ControllerHandle, group: Vec<Guid>) -> anyhow::Result<()> {
    let mut waiting = 0usize;
    for guid in group.iter() {
        let state = ctx.state(*guid)?;
        if !(state.reached(ResourceState::Ready) || state.is_failed()) {
            waiting += 1;
        }
    }

    if waiting > 0 {
        trace!(waiting, total = group.len(), "start barrier holding");
        let interval = ctx.config().start_barrier_interval;
        if let Err(err) = schedule_start_barrier(ctx, group, TimeSpec::After(interval)) {
            trace!(error = %err, "start barrier not rescheduled");
        }
        return Ok(());
    }

    debug!(resources = group.len(), "start barrier released");
    for guid in group {
        if !ctx.state(guid)?.is_failed() {
            schedule_action(ctx, guid, ResourceAction::Start, TimeSpec::Now)?;
        }
    }
    Ok(())
}
