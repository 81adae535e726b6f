use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Process-unique identifier of a resource within one controller.
pub type Guid = u64;

/// Lifecycle state of a resource manager.
///
/// The derive order is the progress order. Comparisons such as
/// `state < ResourceState::Ready` are only meaningful for healthy resources;
/// use [`ResourceState::reached`] when the resource may have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    New,
    Discovered,
    Provisioned,
    Ready,
    Started,
    Stopped,
    Finished,
    Failed,
    Released,
}

impl ResourceState {
    /// Whether a resource in `self` has progressed to at least `target`.
    ///
    /// A failed resource never reaches anything but `Failed`.
    pub fn reached(self, target: ResourceState) -> bool {
        match (self, target) {
            (ResourceState::Failed, t) => t == ResourceState::Failed,
            (_, ResourceState::Failed) => false,
            // Natural completion and explicit stop are both "past started".
            (ResourceState::Finished, ResourceState::Stopped) => true,
            (s, t) => s >= t,
        }
    }

    pub fn is_failed(self) -> bool {
        self == ResourceState::Failed
    }

    /// No more lifecycle work will happen for a resource in this state.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ResourceState::Stopped | ResourceState::Finished | ResourceState::Released
        )
    }

    /// Legal forward transitions. `Failed` is reachable from every state
    /// except `Released`, and nothing leaves `Failed`.
    pub fn can_transition(self, to: ResourceState) -> bool {
        use ResourceState::*;
        match (self, to) {
            (Failed, _) | (Released, _) => false,
            (_, Failed) => true,
            (_, Released) => true,
            (Stopped, Finished) | (Finished, Stopped) => false,
            (Started, Stopped) | (Started, Finished) => true,
            (from, to) => to > from && to <= Started,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::New => "NEW",
            ResourceState::Discovered => "DISCOVERED",
            ResourceState::Provisioned => "PROVISIONED",
            ResourceState::Ready => "READY",
            ResourceState::Started => "STARTED",
            ResourceState::Stopped => "STOPPED",
            ResourceState::Finished => "FINISHED",
            ResourceState::Failed => "FAILED",
            ResourceState::Released => "RELEASED",
        };
        f.write_str(s)
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(ResourceState::New),
            "discovered" => Ok(ResourceState::Discovered),
            "provisioned" => Ok(ResourceState::Provisioned),
            "ready" => Ok(ResourceState::Ready),
            "started" => Ok(ResourceState::Started),
            "stopped" => Ok(ResourceState::Stopped),
            "finished" => Ok(ResourceState::Finished),
            "failed" => Ok(ResourceState::Failed),
            "released" => Ok(ResourceState::Released),
            other => Err(format!("invalid resource state: {other}")),
        }
    }
}

/// Actions that can be gated by conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
    Deploy,
    Start,
    Stop,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceAction::Deploy => "DEPLOY",
            ResourceAction::Start => "START",
            ResourceAction::Stop => "STOP",
        };
        f.write_str(s)
    }
}

impl FromStr for ResourceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deploy" => Ok(ResourceAction::Deploy),
            "start" => Ok(ResourceAction::Start),
            "stop" => Ok(ResourceAction::Stop),
            other => Err(format!(
                "invalid action: {other} (expected \"deploy\", \"start\" or \"stop\")"
            )),
        }
    }
}

/// Aggregate health of an experiment run. Higher is worse; never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FailureLevel {
    Ok = 0,
    ResourceFailure = 1,
    ControllerFailure = 2,
}

impl FailureLevel {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => FailureLevel::Ok,
            1 => FailureLevel::ResourceFailure,
            _ => FailureLevel::ControllerFailure,
        }
    }
}

impl Default for FailureLevel {
    fn default() -> Self {
        FailureLevel::Ok
    }
}

/// Whether the controller still accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Terminated,
}
