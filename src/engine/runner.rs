// src/engine/runner.rs

//! Repeat an experiment until a metric converges.

use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{ExperimentController, WaitFor, WaitOutcome};
use crate::errors::{ExpctlError, Result};
use crate::types::Guid;

type Metric<'a> = Box<dyn FnMut(&ExperimentController, usize) -> Option<f64> + 'a>;
type Convergence<'a> = Box<dyn FnMut(usize, &[f64]) -> bool + 'a>;

/// Summary of a runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub runs: usize,
    /// One value per run for which the metric produced one.
    pub samples: Vec<f64>,
    /// Whether the loop ended because the samples converged.
    pub converged: bool,
}

/// Runs a freshly built experiment repeatedly.
///
/// Each run: build a controller, deploy everything, wait for the guids
/// returned by the builder to finish, linger `wait_time`, compute the
/// metric and shut down. The loop ends once `max_runs` is reached or, after
/// `min_runs`, once the convergence check accepts the samples.
pub struct ExperimentRunner<'a> {
    min_runs: usize,
    max_runs: Option<usize>,
    wait_time: Duration,
    wait_timeout: Option<Duration>,
    metric: Option<Metric<'a>>,
    convergence: Convergence<'a>,
}

impl<'a> Default for ExperimentRunner<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ExperimentRunner<'a> {
    pub fn new() -> Self {
        Self {
            min_runs: 1,
            max_runs: None,
            wait_time: Duration::ZERO,
            wait_timeout: None,
            metric: None,
            convergence: Box::new(|_, samples| normal_convergence(samples)),
        }
    }

    pub fn min_runs(mut self, n: usize) -> Self {
        self.min_runs = n.max(1);
        self
    }

    pub fn max_runs(mut self, n: usize) -> Self {
        self.max_runs = Some(n);
        self
    }

    /// Time to linger after the experiment finished, before measuring.
    pub fn wait_time(mut self, d: Duration) -> Self {
        self.wait_time = d;
        self
    }

    /// Give up waiting for a run to finish after this long.
    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = Some(d);
        self
    }

    /// Metric computed after each run from the (still running) controller.
    pub fn metric(
        mut self,
        f: impl FnMut(&ExperimentController, usize) -> Option<f64> + 'a,
    ) -> Self {
        self.metric = Some(Box::new(f));
        self
    }

    /// Replace the default convergence check ([`normal_convergence`]).
    pub fn convergence(mut self, f: impl FnMut(usize, &[f64]) -> bool + 'a) -> Self {
        self.convergence = Box::new(f);
        self
    }

    /// Run experiments built by `build(run)` until done.
    ///
    /// `build` returns the controller and the guids to wait for.
    pub fn run(
        &mut self,
        mut build: impl FnMut(usize) -> Result<(ExperimentController, Vec<Guid>)>,
    ) -> Result<RunSummary> {
        if self.max_runs.is_none() && self.metric.is_none() {
            return Err(ExpctlError::ConfigError(
                "experiment runner needs max_runs or a metric to stop".to_string(),
            ));
        }

        let mut samples = Vec::new();
        let mut run = 0usize;

        loop {
            run += 1;
            info!(run, "experiment run starting");

            let (ec, guids) = build(run)?;
            ec.deploy()?;
            let outcome = ec.wait(&guids, WaitFor::Finished, self.wait_timeout)?;
            if outcome != WaitOutcome::Reached {
                warn!(run, ?outcome, exp_id = %ec.exp_id(), "run did not finish cleanly");
            }
            if !self.wait_time.is_zero() {
                std::thread::sleep(self.wait_time);
            }

            if let Some(metric) = self.metric.as_mut() {
                if let Some(value) = metric(&ec, run) {
                    samples.push(value);
                }
            }
            let report = ec.shutdown();
            info!(run, released = report.released.len(), "experiment run finished");

            if self.max_runs.is_some_and(|max| run >= max) {
                return Ok(RunSummary {
                    runs: run,
                    samples,
                    converged: false,
                });
            }

            if self.metric.is_some() && run >= self.min_runs && (self.convergence)(run, &samples) {
                info!(run, "metric converged");
                return Ok(RunSummary {
                    runs: run,
                    samples,
                    converged: true,
                });
            }
        }
    }
}

/// Stop once the 95% confidence half-width (2 standard errors) is within
/// 5% of the sample mean.
pub fn normal_convergence(samples: &[f64]) -> bool {
    let n = samples.len();
    if n == 0 {
        return false;
    }

    let mean = samples.iter().sum::<f64>() / n as f64;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    let std_err = variance.sqrt() / (n as f64).sqrt();

    mean.abs() * 0.05 >= 2.0 * std_err
}
