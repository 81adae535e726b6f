// src/exec/task.rs

//! Scheduled callbacks and their tracked outcome.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::ControllerHandle;

/// Identifier handed out by the scheduler; also the FIFO tie-break key.
pub type TaskId = u64;

/// Type-erased value returned by a callback.
pub type TaskOutput = Box<dyn Any + Send>;

/// Work executed by a pool worker. It receives the controller context rather
/// than capturing it, so queued tasks never keep the controller alive.
pub type Callback = Box<dyn FnOnce(&ControllerHandle) -> anyhow::Result<TaskOutput> + Send>;

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting in the scheduler.
    New,
    /// Picked up by a worker.
    Running,
    /// Callback returned successfully.
    Done,
    /// Callback returned an error or panicked.
    Error,
}

/// Shared, observable outcome of a task.
///
/// Only tracked tasks are retrievable through the controller, but every
/// task owns one so the worker code path is the same.
pub struct TaskRecord {
    id: TaskId,
    inner: Mutex<RecordInner>,
}

struct RecordInner {
    status: TaskStatus,
    output: Option<TaskOutput>,
    error: Option<String>,
}

impl TaskRecord {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            inner: Mutex::new(RecordInner {
                status: TaskStatus::New,
                output: None,
                error: None,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// Error text if the callback failed.
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Clone of the callback's return value, if it returned a `T`.
    pub fn output<T: Any + Clone>(&self) -> Option<T> {
        self.lock()
            .output
            .as_ref()
            .and_then(|o| o.downcast_ref::<T>())
            .cloned()
    }

    pub(crate) fn mark_running(&self) {
        self.lock().status = TaskStatus::Running;
    }

    pub(crate) fn complete(&self, result: Result<TaskOutput, String>) {
        let mut inner = self.lock();
        match result {
            Ok(output) => {
                inner.status = TaskStatus::Done;
                inner.output = Some(output);
            }
            Err(err) => {
                inner.status = TaskStatus::Error;
                inner.error = Some(err);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("error", &inner.error)
            .finish_non_exhaustive()
    }
}

/// A callback waiting in the scheduler.
pub struct Task {
    /// Short human-readable label used in logs (e.g. `"deploy guid=3"`).
    pub label: String,
    pub(crate) callback: Callback,
    pub(crate) record: Arc<TaskRecord>,
}

impl Task {
    pub(crate) fn new(label: String, callback: Callback, record: Arc<TaskRecord>) -> Self {
        Self {
            label,
            callback,
            record,
        }
    }

    pub fn id(&self) -> TaskId {
        self.record.id()
    }

    pub fn record(&self) -> &Arc<TaskRecord> {
        &self.record
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
