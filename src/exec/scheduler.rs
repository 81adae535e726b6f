// src/exec/scheduler.rs

//! Thread-safe timestamp-ordered queue with lazy cancellation.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::trace;

use crate::errors::{ExpctlError, Result};
use crate::exec::task::TaskId;

/// An entry handed out by the scheduler.
#[derive(Debug)]
pub struct Scheduled<T> {
    pub id: TaskId,
    pub timestamp: Instant,
    pub payload: T,
}

/// Result of asking for the next entry that is due at a given instant.
#[derive(Debug)]
pub enum NextDue<T> {
    /// The earliest valid entry is due and has been removed from the queue.
    Ready(Scheduled<T>),
    /// The earliest valid entry is due at this instant.
    NotBefore(Instant),
    /// Nothing valid is queued.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapKey {
    timestamp: Instant,
    id: TaskId,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Reverse<HeapKey>>,
    /// Valid entries. Removing an id from here is the whole cancellation;
    /// the stale heap key is discarded when it reaches the top.
    pending: HashMap<TaskId, Scheduled<T>>,
    next_id: TaskId,
    closed: bool,
}

impl<T> Inner<T> {
    fn discard_stale_top(&mut self) {
        while let Some(Reverse(key)) = self.heap.peek() {
            if self.pending.contains_key(&key.id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn pop_top(&mut self) -> Option<Scheduled<T>> {
        self.discard_stale_top();
        let Reverse(key) = self.heap.pop()?;
        self.pending.remove(&key.id)
    }

    fn next_due(&mut self, now: Instant) -> NextDue<T> {
        self.discard_stale_top();
        let top = self.heap.peek().map(|Reverse(key)| key.timestamp);
        match top {
            None => NextDue::Empty,
            Some(timestamp) if timestamp > now => NextDue::NotBefore(timestamp),
            Some(_) => match self.pop_top() {
                Some(entry) => NextDue::Ready(entry),
                None => NextDue::Empty,
            },
        }
    }
}

/// Binary-heap scheduler ordering entries by `(timestamp, id)`.
///
/// Ids grow monotonically, so entries with equal timestamps come out in
/// submission order. All operations take a single internal lock; a condition
/// variable lets pool workers sleep until the earliest entry is due or new
/// work is scheduled.
pub struct HeapScheduler<T> {
    inner: Mutex<Inner<T>>,
    wakeup: Condvar,
}

impl<T> Default for HeapScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HeapScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HeapScheduler")
            .field("pending", &inner.pending.len())
            .field("heap", &inner.heap.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T> HeapScheduler<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Queue `payload` to become due at `timestamp`.
    pub fn schedule(&self, timestamp: Instant, payload: T) -> Result<TaskId> {
        self.schedule_with(timestamp, |_| payload)
    }

    /// Like [`schedule`](Self::schedule), but builds the payload from the id
    /// that was assigned to it.
    pub fn schedule_with(
        &self,
        timestamp: Instant,
        build: impl FnOnce(TaskId) -> T,
    ) -> Result<TaskId> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ExpctlError::ControllerShutdown);
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let payload = build(id);
        inner.heap.push(Reverse(HeapKey { timestamp, id }));
        inner.pending.insert(
            id,
            Scheduled {
                id,
                timestamp,
                payload,
            },
        );
        drop(inner);

        trace!(task_id = id, "scheduled");
        self.wakeup.notify_one();
        Ok(id)
    }

    /// Cancel a queued entry. Unknown or already-handed-out ids are ignored.
    ///
    /// Returns the payload if the entry was still queued.
    pub fn remove(&self, id: TaskId) -> Option<T> {
        self.lock().pending.remove(&id).map(|entry| entry.payload)
    }

    /// Pop the earliest valid entry regardless of whether it is due yet.
    pub fn next(&self) -> Option<Scheduled<T>> {
        self.lock().pop_top()
    }

    /// Pop the earliest valid entry only if it is due at `now`.
    pub fn next_due(&self, now: Instant) -> NextDue<T> {
        self.lock().next_due(now)
    }

    /// Block until an entry is due and return it, or return `None` once the
    /// scheduler has been closed.
    pub fn wait_next_due(&self) -> Option<Scheduled<T>> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return None;
            }

            match inner.next_due(Instant::now()) {
                NextDue::Ready(entry) => {
                    let more_due = matches!(
                        inner.heap.peek(),
                        Some(Reverse(key)) if key.timestamp <= Instant::now()
                    );
                    drop(inner);
                    if more_due {
                        self.wakeup.notify_one();
                    }
                    return Some(entry);
                }
                NextDue::NotBefore(at) => {
                    let timeout = at.saturating_duration_since(Instant::now());
                    inner = self
                        .wakeup
                        .wait_timeout(inner, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                NextDue::Empty => {
                    inner = self
                        .wakeup
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Stop accepting entries, drop everything queued and wake all waiters.
    ///
    /// Returns the number of entries that were discarded.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        inner.heap.clear();
        let discarded = std::mem::take(&mut inner.pending);
        drop(inner);

        self.wakeup.notify_all();
        discarded.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of valid queued entries.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
