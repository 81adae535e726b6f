// src/engine/waiting.rs

//! Polling waits on aggregate resource state.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::engine::ExperimentController;
use crate::errors::Result;
use crate::exec::saturating_deadline;
use crate::types::{FailureLevel, Guid, ResourceState};

/// What a wait is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// Every resource has reached this state.
    State(ResourceState),
    /// Every resource is FINISHED, STOPPED or RELEASED.
    Finished,
}

impl WaitFor {
    pub fn is_met(self, state: ResourceState) -> bool {
        match self {
            WaitFor::State(target) => state.reached(target),
            WaitFor::Finished => state.is_finished(),
        }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every resource got there.
    Reached,
    /// These resources failed before getting there.
    Failed(Vec<Guid>),
    /// The controller shut down or hit a controller failure.
    Aborted,
    /// The timeout expired first.
    TimedOut,
}

impl WaitOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, WaitOutcome::Reached)
    }
}

impl ExperimentController {
    /// Block until every resource in `guids` is READY (or later).
    pub fn wait_deployed(&self, guids: &[Guid]) -> Result<WaitOutcome> {
        self.wait(guids, WaitFor::State(ResourceState::Ready), None)
    }

    /// Block until every resource in `guids` is STARTED (or later).
    pub fn wait_started(&self, guids: &[Guid]) -> Result<WaitOutcome> {
        self.wait(guids, WaitFor::State(ResourceState::Started), None)
    }

    /// Block until every resource in `guids` is finished.
    pub fn wait_finished(&self, guids: &[Guid]) -> Result<WaitOutcome> {
        self.wait(guids, WaitFor::Finished, None)
    }

    /// Poll every `poll_interval` until `target` holds for all of `guids`,
    /// a resource fails, the controller aborts or `timeout` expires.
    pub fn wait(
        &self,
        guids: &[Guid],
        target: WaitFor,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let deadline = timeout.map(|t| saturating_deadline(Instant::now(), t));
        let interval = self.config().poll_interval;

        loop {
            if let Some(outcome) = self.check_wait(guids, target)? {
                return Ok(outcome);
            }
            let Some(sleep) = next_sleep(deadline, interval) else {
                debug!(?target, "wait timed out");
                return Ok(WaitOutcome::TimedOut);
            };
            std::thread::sleep(sleep);
        }
    }

    /// Async flavour of [`wait`](Self::wait); sleeps on the tokio timer
    /// instead of blocking the thread.
    pub async fn wait_async(
        &self,
        guids: &[Guid],
        target: WaitFor,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let deadline = timeout.map(|t| saturating_deadline(Instant::now(), t));
        let interval = self.config().poll_interval;

        loop {
            if let Some(outcome) = self.check_wait(guids, target)? {
                return Ok(outcome);
            }
            let Some(sleep) = next_sleep(deadline, interval) else {
                debug!(?target, "wait timed out");
                return Ok(WaitOutcome::TimedOut);
            };
            tokio::time::sleep(sleep).await;
        }
    }

    fn check_wait(&self, guids: &[Guid], target: WaitFor) -> Result<Option<WaitOutcome>> {
        let mut pending = 0usize;
        let mut failed = Vec::new();

        for &guid in guids {
            let state = self.state(guid)?;
            if target.is_met(state) {
                continue;
            }
            if state.is_failed() {
                failed.push(guid);
            } else {
                pending += 1;
            }
        }

        if !failed.is_empty() {
            debug!(?failed, ?target, "wait ended by failed resources");
            return Ok(Some(WaitOutcome::Failed(failed)));
        }
        if pending == 0 {
            return Ok(Some(WaitOutcome::Reached));
        }
        if self.finished() || self.failure_level() == FailureLevel::ControllerFailure {
            return Ok(Some(WaitOutcome::Aborted));
        }

        trace!(pending, ?target, "waiting");
        Ok(None)
    }
}

fn next_sleep(deadline: Option<Instant>, interval: Duration) -> Option<Duration> {
    match deadline {
        None => Some(interval),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                None
            } else {
                Some(left.min(interval))
            }
        }
    }
}
