//! Result aggregation.
//!
//! The aggregator keeps the handles of every dispatched task and scans them
//! once per `poll_interval`. Terminal outcomes are removed from the set and
//! their records streamed out straight away, so a consumer sees the first
//! match while the rest of the run is still going.
use tokio::{
    sync::{
        mpsc::{self, error::TryRecvError},
        watch,
    },
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    EngineState, FailedTarget, Finding, Outcome, TaskReport,
    options::RunOptions,
    pool::{ExecutionPool, PoolStats, TaskHandle},
};
use crate::{error::EngineError, target::Target, worker::Worker};

/// Everything the aggregator saw during a run.
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub completed: usize,
    pub records: usize,
    pub failed: Vec<FailedTarget>,
    pub timed_out: Vec<Target>,
    /// The pool stopped dispatch on a first match.
    pub stopped_early: bool,
    /// Pool fault that cut the run short.
    pub fault: Option<EngineError>,
}

impl Collected {
    /// Tasks that reached a terminal outcome.
    pub fn terminal(&self) -> usize {
        self.completed + self.failed.len() + self.timed_out.len()
    }

    fn absorb<R>(&mut self, report: TaskReport<R>, findings: &mpsc::UnboundedSender<Finding<R>>) {
        let TaskReport {
            task,
            target,
            elapsed,
            outcome,
        } = report;
        let elapsed_ms = elapsed.as_millis() as u64;

        match outcome {
            Outcome::Completed(records) => {
                self.completed += 1;
                self.records += records.len();
                debug!(%task, %target, elapsed_ms, records = records.len(), "task completed");

                for record in records {
                    // A consumer that went away does not stop the run.
                    findings
                        .send(Finding {
                            target: target.clone(),
                            record,
                        })
                        .ok();
                }
            }
            Outcome::Failed(e) => {
                let error = format!("{e:#}");
                warn!(%task, %target, elapsed_ms, %error, "task failed");
                self.failed.push(FailedTarget { target, error });
            }
            Outcome::TimedOut => {
                warn!(%task, %target, elapsed_ms, "task timed out");
                self.timed_out.push(target);
            }
        }
    }
}

/// Runs until the dispatch side has hung up and every outstanding task is
/// terminal, or until the pool reports a fault.
pub(crate) async fn collect<W: Worker>(
    pool: &ExecutionPool<W>,
    mut handles: mpsc::UnboundedReceiver<TaskHandle>,
    findings: mpsc::UnboundedSender<Finding<W::Record>>,
    options: &RunOptions,
    stop: &CancellationToken,
    state: &watch::Sender<EngineState>,
    stats: &watch::Sender<PoolStats>,
) -> Collected {
    let mut collected = Collected::default();
    let mut outstanding: Vec<TaskHandle> = Vec::new();
    let mut dispatch_open = true;

    loop {
        while dispatch_open {
            match handles.try_recv() {
                Ok(handle) => outstanding.push(handle),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => dispatch_open = false,
            }
        }

        outstanding.retain(|handle| match pool.poll(handle) {
            Some(report) => {
                collected.absorb(report, &findings);
                false
            }
            None => true,
        });

        stats.send_replace(pool.stats());
        collected.stopped_early |= pool.stopped_on_match();

        if let Some(fault) = pool.take_fault() {
            error!(
                error = %fault,
                outstanding = outstanding.len(),
                "execution pool fault, abandoning the run"
            );
            stop.cancel();
            collected.fault = Some(fault);
            break;
        }

        if !dispatch_open || stop.is_cancelled() {
            state.send_if_modified(|current| {
                if *current == EngineState::Running {
                    *current = EngineState::Draining;
                    true
                } else {
                    false
                }
            });
        }

        if !dispatch_open && outstanding.is_empty() {
            break;
        }

        sleep(options.poll_interval).await;
    }

    debug!(
        completed = collected.completed,
        failed = collected.failed.len(),
        timed_out = collected.timed_out.len(),
        "aggregation finished"
    );
    collected
}
