// src/exec/mod.rs

//! Discrete-event execution layer.
//!
//! - [`timespec`] parses relative (`"0.5s"`) and absolute time literals.
//! - [`task`] defines scheduled callbacks and their observable outcome.
//! - [`scheduler`] is the thread-safe, lazily-cancellable priority queue.
//! - [`pool`] runs due tasks on a fixed set of OS worker threads.

pub mod pool;
pub mod scheduler;
pub mod task;
pub mod timespec;

pub use pool::WorkerPool;
pub use scheduler::{HeapScheduler, NextDue, Scheduled};
pub use task::{Callback, Task, TaskId, TaskOutput, TaskRecord, TaskStatus};
pub use timespec::{TimeSpec, format_timestamp, parse_duration, saturating_deadline};
