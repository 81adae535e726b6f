// src/dag/conditions.rs

//! Conditions gating resource actions on the state of other resources.

use std::time::{Duration, Instant};

use crate::dag::Registry;
use crate::exec::TimeSpec;
use crate::types::{Guid, ResourceState};

/// "Only once every guard has reached `state` (and `delay` has passed since
/// the last one did)."
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub guards: Vec<Guid>,
    pub state: ResourceState,
    pub delay: Option<TimeSpec>,
}

impl Condition {
    pub fn new(guards: Vec<Guid>, state: ResourceState) -> Self {
        Self {
            guards,
            state,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: TimeSpec) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Result of evaluating a set of conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// All conditions hold; the action may run now.
    Satisfied,
    /// Some guard has not reached its state yet.
    Unmet,
    /// Guards are there but a delay is still running; retry after this long.
    Delay(Duration),
    /// A guard failed or vanished, so the conditions can never hold.
    Blocked(String),
}

/// Evaluate every condition in `conditions` at `now`.
///
/// A guard in `Failed` blocks the condition unless `Failed` is the awaited
/// state. The delay of a condition is measured from the latest time any of
/// its guards entered the awaited state.
pub fn evaluate(conditions: &[Condition], registry: &Registry, now: Instant) -> Verdict {
    let mut unmet = false;
    let mut wait = Duration::ZERO;

    for cond in conditions {
        let mut since: Option<Instant> = None;
        let mut cond_met = true;

        for &guard in &cond.guards {
            let Some(rm) = registry.get(guard) else {
                return Verdict::Blocked(format!("guard {guard} is not registered"));
            };
            let core = rm.core();
            let state = core.state();

            if state.is_failed() && cond.state != ResourceState::Failed {
                return Verdict::Blocked(format!("guard {guard} ({}) failed", core.rtype()));
            }
            if !state.reached(cond.state) {
                cond_met = false;
                continue;
            }

            let at = core.reached_at(cond.state).unwrap_or(now);
            since = Some(since.map_or(at, |s| s.max(at)));
        }

        if !cond_met {
            unmet = true;
            continue;
        }

        if let Some(delay) = &cond.delay {
            wait = wait.max(delay.remaining(since.unwrap_or(now), now));
        }
    }

    if unmet {
        Verdict::Unmet
    } else if !wait.is_zero() {
        Verdict::Delay(wait)
    } else {
        Verdict::Satisfied
    }
}
