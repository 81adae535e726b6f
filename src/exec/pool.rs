// src/exec/pool.rs

//! Fixed-size pool of OS worker threads draining the controller scheduler.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use crate::engine::ControllerHandle;
use crate::errors::Result;
use crate::exec::task::Task;
use crate::types::FailureLevel;

/// Worker threads pulling due tasks from the shared scheduler.
///
/// Each worker blocks inside [`HeapScheduler::wait_next_due`] until a task is
/// due, runs it to completion and goes back for the next one. A worker is
/// only ever occupied by the callback it is running; resources waiting on
/// each other reschedule instead of blocking here.
///
/// [`HeapScheduler::wait_next_due`]: crate::exec::HeapScheduler::wait_next_due
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn spawn(size: usize, handle: &ControllerHandle) -> Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);

        for idx in 0..size {
            let handle = handle.clone();
            let worker = thread::Builder::new()
                .name(format!("expctl-worker-{idx}"))
                .spawn(move || worker_loop(idx, handle))?;
            workers.push(worker);
        }

        info!(workers = size, "worker pool started");
        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit. The scheduler must have been closed
    /// first, otherwise this blocks forever.
    ///
    /// A worker that died outside a task callback escalates the controller
    /// failure level.
    pub fn join(self, handle: &ControllerHandle) {
        let current = thread::current().id();

        for worker in self.workers {
            // Shutdown requested from inside a callback: that worker exits on
            // its own once the callback returns.
            if worker.thread().id() == current {
                continue;
            }

            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!(worker = %name, "worker thread terminated abnormally");
                handle.escalate(FailureLevel::ControllerFailure);
            }
        }

        debug!("worker pool joined");
    }
}

fn worker_loop(idx: usize, handle: ControllerHandle) {
    trace!(worker = idx, "worker started");

    while let Some(entry) = handle.scheduler().wait_next_due() {
        execute(&handle, entry.payload);
    }

    trace!(worker = idx, "worker exiting (scheduler closed)");
}

/// Run one task, capturing its result or failure in the task record.
///
/// Errors returned by callbacks are logged and recorded; they do not stop
/// the worker. A panic is treated as a controller bug and escalates the
/// failure level to `ControllerFailure`.
fn execute(handle: &ControllerHandle, task: Task) {
    let Task {
        label,
        callback,
        record,
    } = task;

    record.mark_running();
    trace!(task_id = record.id(), task = %label, "executing task");

    match panic::catch_unwind(AssertUnwindSafe(|| callback(handle))) {
        Ok(Ok(output)) => record.complete(Ok(output)),
        Ok(Err(err)) => {
            warn!(
                task_id = record.id(),
                task = %label,
                error = %format!("{err:#}"),
                "task callback returned an error"
            );
            record.complete(Err(format!("{err:#}")));
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!(
                task_id = record.id(),
                task = %label,
                panic = %msg,
                "task callback panicked"
            );
            handle.escalate(FailureLevel::ControllerFailure);
            record.complete(Err(format!("panicked: {msg}")));
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
