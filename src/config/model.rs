// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::exec::TimeSpec;
use crate::resource::Attempts;
use crate::types::{Guid, ResourceAction, ResourceState};

/// Experiment description as read from a TOML file.
///
/// ```toml
/// [controller]
/// exp_id = "ping-test"
/// worker_threads = 8
/// reschedule_delay = "0.5s"
///
/// [resource.node]
/// type = "local::Node"
///
/// [resource.app]
/// type = "local::Application"
/// connect = ["node"]
/// traces = ["stdout"]
///
/// [resource.app.attributes]
/// command = "echo hello"
///
/// [[condition]]
/// targets = ["app2"]
/// action = "start"
/// guards = ["app"]
/// state = "finished"
/// delay = "2s"
/// ```
///
/// Only `[resource.*]` is required. Deserialization does not validate
/// references; see [`ExperimentFile`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawExperimentFile {
    #[serde(default)]
    pub controller: ControllerSection,

    /// Resources keyed by a user-chosen name.
    #[serde(default)]
    pub resource: BTreeMap<String, ResourceSection>,

    #[serde(default)]
    pub condition: Vec<ConditionSection>,
}

/// `[controller]` section. Durations are time literals (`"0.5s"`, `"2m"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    #[serde(default)]
    pub exp_id: Option<String>,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Delay before retrying an action whose dependencies are not ready.
    #[serde(default = "default_reschedule_delay")]
    pub reschedule_delay: String,

    /// Upper bound for the retry delay when `backoff_factor > 1`.
    #[serde(default)]
    pub max_reschedule_delay: Option<String>,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Give up on an action (resource -> FAILED) after waiting this long.
    #[serde(default)]
    pub max_wait: Option<String>,

    /// Give up on an action after this many retries.
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default = "default_start_barrier_interval")]
    pub start_barrier_interval: String,

    /// Where drivers keep per-resource artefacts. Defaults to the system
    /// temp directory.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
}

fn default_worker_threads() -> usize {
    50
}

fn default_reschedule_delay() -> String {
    "0.5s".to_string()
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_poll_interval() -> String {
    "0.5s".to_string()
}

fn default_start_barrier_interval() -> String {
    "1s".to_string()
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            exp_id: None,
            worker_threads: default_worker_threads(),
            reschedule_delay: default_reschedule_delay(),
            max_reschedule_delay: None,
            backoff_factor: default_backoff_factor(),
            max_wait: None,
            max_retries: None,
            poll_interval: default_poll_interval(),
            start_barrier_interval: default_start_barrier_interval(),
            root_dir: None,
        }
    }
}

/// `[resource.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSection {
    /// Registered resource type, e.g. `"local::Application"`.
    #[serde(rename = "type")]
    pub rtype: String,

    /// Explicit guid; assigned automatically when absent.
    #[serde(default)]
    pub guid: Option<Guid>,

    /// Names of resources this one is connected to. Connections are
    /// symmetric, so listing them on one side is enough.
    #[serde(default)]
    pub connect: Vec<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, toml::Value>,

    /// Traces to enable.
    #[serde(default)]
    pub traces: Vec<String>,
}

/// `[[condition]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSection {
    pub targets: Vec<String>,
    pub action: ResourceAction,
    pub guards: Vec<String>,
    pub state: ResourceState,
    #[serde(default)]
    pub delay: Option<String>,
}

/// How an action that cannot proceed yet is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_wait: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
            factor: 1.0,
            max_wait: None,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.factor <= 1.0 {
            return self.delay;
        }
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.delay.as_secs_f64() * self.factor.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay.max(self.delay))
    }

    /// Why the retries are exhausted, if they are.
    pub fn exhausted(&self, attempts: Attempts, now: Instant) -> Option<String> {
        if let Some(max) = self.max_retries.filter(|max| attempts.count > *max) {
            return Some(format!("gave up after {max} retries"));
        }
        self.max_wait
            .filter(|max_wait| now.saturating_duration_since(attempts.first) >= *max_wait)
            .map(|max_wait| format!("gave up after waiting {:.1}s", max_wait.as_secs_f64()))
    }
}

/// Validated controller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Experiment id; generated when `None`.
    pub exp_id: Option<String>,
    pub worker_threads: usize,
    pub retry: RetryPolicy,
    /// Polling period of the `wait_*` helpers.
    pub poll_interval: Duration,
    /// Polling period of the start barrier.
    pub start_barrier_interval: Duration,
    pub root_dir: PathBuf,
}

/// Environment variable overriding [`ControllerConfig::worker_threads`].
pub const WORKERS_ENV: &str = "EXPCTL_WORKERS";

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            exp_id: None,
            worker_threads: default_worker_threads(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(500),
            start_barrier_interval: Duration::from_secs(1),
            root_dir: std::env::temp_dir().join("expctl"),
        }
    }
}

impl ControllerConfig {
    pub fn with_exp_id(mut self, exp_id: impl Into<String>) -> Self {
        self.exp_id = Some(exp_id.into());
        self
    }

    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Fixed retry delay (no backoff).
    pub fn with_reschedule_delay(mut self, delay: Duration) -> Self {
        self.retry.delay = delay;
        self.retry.max_delay = delay;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.retry.max_wait = Some(max_wait);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = Some(max_retries);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_start_barrier_interval(mut self, interval: Duration) -> Self {
        self.start_barrier_interval = interval;
        self
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    /// Apply `EXPCTL_WORKERS` if it is set to a positive integer.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = std::env::var(WORKERS_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            self.worker_threads = n;
        }
        self
    }
}

/// A validated `[[condition]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionSpec {
    pub targets: Vec<String>,
    pub action: ResourceAction,
    pub guards: Vec<String>,
    pub state: ResourceState,
    pub delay: Option<TimeSpec>,
}

/// Validated experiment description.
///
/// Construct via `ExperimentFile::try_from(raw)` (or
/// [`load_and_validate`](crate::config::load_and_validate)), which checks
/// references, time literals and the condition graph.
#[derive(Debug, Clone)]
pub struct ExperimentFile {
    pub controller: ControllerConfig,
    pub resource: BTreeMap<String, ResourceSection>,
    pub condition: Vec<ConditionSpec>,
}
