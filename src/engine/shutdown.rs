// src/engine/shutdown.rs

//! Orderly teardown of an experiment.

use std::sync::{Arc, PoisonError};
use std::thread;

use tracing::{error, info, warn};

use crate::dag::{ALL_ACTIONS, ConditionGraph};
use crate::engine::lifecycle;
use crate::engine::{ControllerHandle, ExperimentController};
use crate::resource::ResourceManager;
use crate::types::Guid;

/// What happened during [`ExperimentController::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that were still queued and got discarded.
    pub discarded_tasks: usize,
    /// Resources stopped during teardown.
    pub stopped: Vec<Guid>,
    /// Resources that ended in RELEASED.
    pub released: Vec<Guid>,
    /// Resources whose stop or release failed, with the reason.
    pub errors: Vec<(Guid, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug)]
struct Teardown {
    guid: Guid,
    stopped: bool,
    released: bool,
    error: Option<String>,
}

impl ExperimentController {
    /// Shut the experiment down.
    ///
    /// 1. Stop accepting tasks, discard the queue and join the workers.
    /// 2. Stop every STARTED resource and release every resource, in waves:
    ///    a resource is torn down before the resources it waits on.
    ///    Resources within a wave are torn down in parallel.
    ///
    /// Every resource gets its `release` hook called, failed ones included.
    /// Errors are collected, never propagated. Calling this again returns
    /// the first report.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut slot = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }

        let handle = self.handle.clone();
        handle.mark_terminated();

        let mut report = ShutdownReport {
            discarded_tasks: handle.scheduler().close(),
            ..ShutdownReport::default()
        };

        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.join(&handle);
        }

        let registry = handle.registry();
        let guids = registry.guids();
        let waves = ConditionGraph::from_registry(registry, ALL_ACTIONS).release_waves(&guids);
        let batch = self.config().worker_threads.max(1);

        for wave in waves {
            for chunk in wave.chunks(batch) {
                let outcomes = thread::scope(|scope| {
                    let running: Vec<_> = chunk
                        .iter()
                        .filter_map(|guid| registry.get(*guid))
                        .map(|rm| {
                            let handle = &handle;
                            let guid = rm.guid();
                            (guid, scope.spawn(move || teardown(handle, rm)))
                        })
                        .collect();

                    running
                        .into_iter()
                        .map(|(guid, worker)| {
                            worker.join().unwrap_or_else(|_| Teardown {
                                guid,
                                stopped: false,
                                released: false,
                                error: Some("teardown panicked".to_string()),
                            })
                        })
                        .collect::<Vec<_>>()
                });

                for outcome in outcomes {
                    if outcome.stopped {
                        report.stopped.push(outcome.guid);
                    }
                    if outcome.released {
                        report.released.push(outcome.guid);
                    }
                    if let Some(reason) = outcome.error {
                        error!(guid = outcome.guid, %reason, "teardown failed");
                        report.errors.push((outcome.guid, reason));
                    }
                }
            }
        }

        if !report.is_clean() {
            warn!(errors = report.errors.len(), "shutdown finished with errors");
        }
        info!(
            exp_id = %handle.exp_id(),
            released = report.released.len(),
            stopped = report.stopped.len(),
            discarded_tasks = report.discarded_tasks,
            failure_level = ?handle.failure_level(),
            "experiment shut down"
        );

        *slot = Some(report.clone());
        report
    }
}

fn teardown(ctx: &ControllerHandle, rm: Arc<dyn ResourceManager>) -> Teardown {
    let guid = rm.guid();
    let _busy = rm.core().begin();

    let mut error = None;
    let stopped = match lifecycle::stop_now(ctx, &rm) {
        Ok(stopped) => stopped,
        Err(reason) => {
            error = Some(format!("stop failed: {reason}"));
            false
        }
    };

    let released = match lifecycle::release_now(ctx, &rm) {
        Ok(released) => released,
        Err(reason) => {
            error.get_or_insert(format!("release failed: {reason}"));
            false
        }
    };

    Teardown {
        guid,
        stopped,
        released,
        error,
    }
}

impl Drop for ExperimentController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
