//! # Hunt Engine
//!
//! Runs one [`Worker`] against a set of targets with bounded concurrency.
//!
//! ## Architecture Overview
//!
//! ```text
//! +------------------------------------------------------+
//! |                     User Code                        |
//! |      (starts a hunt, consumes findings, stops)       |
//! +------------------------------+-----------------------+
//!                                |
//!                                v
//! +------------------------------------------------------+
//! |            Hunter::start  ->  HuntRun                |
//! |   - validate options, supply and shuffle targets     |
//! |   - build the execution pool                         |
//! |   - spawn the driver                                 |
//! +------------------------------+-----------------------+
//!                                |
//!                                v
//! +--------------------------+   +-----------------------+
//! |      dispatch loop       |   |      aggregator       |
//! | probe -> pace -> submit  |-->| poll -> stream -> stop|
//! +------------+-------------+   +-----------+-----------+
//!              |                             ^
//!              v                             |
//! +------------------------------------------------------+
//! |                   ExecutionPool                      |
//! |   `throttle` contexts, one worker session each       |
//! +------------------------------------------------------+
//! ```
//!
//! The dispatch loop and the aggregator run concurrently inside one driver
//! task. Findings leave the driver through an unbounded channel as soon as a
//! task completes.
//!
//! ## Lifecycle
//!
//! ```text
//! Initializing -> Running -> Draining -> Terminated
//! ```
//!
//! `Terminated` is published exactly once, after the pool has been shut
//! down, on every exit path: normal completion, a pool fault, a call to
//! [`HuntRun::abort`], or the run handle being dropped.
//!
//! ## Stopping
//!
//! - [`HuntRun::stop`] (and `stop_on_first_match`) only prevent further
//!   dispatch. Tasks already running finish and are reported.
//! - a first match is signalled by the pool when the task completes, before
//!   its slot is freed, so no target is dispatched after it.
//! - [`HuntRun::abort`] tears the pool down at once. Running tasks never
//!   report.
//!
//! # Example
//! ```rust,no_run
//! use stalkerhunt::{engine::{Hunter, RunOptions}, hunters::PortHunter, target::TargetList};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hunter = Hunter::new(PortHunter::new(vec![22, 445]))
//!         .with_options(RunOptions::default().with_throttle(50).with_probe(false));
//!
//!     let targets: TargetList = "10.0.0.1,10.0.0.2".parse()?;
//!     let mut run = hunter.start(&targets)?;
//!     while let Some(finding) = run.next().await {
//!         println!("{} {}", finding.target, finding.record);
//!     }
//!     let summary = run.finish().await?;
//!     println!("{} targets, {} records", summary.supplied, summary.records);
//!     Ok(())
//! }
//! ```
use std::{
    fmt::{self, Display},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use rand::{SeedableRng, rngs::SmallRng};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::{Stream, StreamExt, wrappers::UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod aggregate;
pub mod dispatch;
pub mod options;
pub mod pool;

pub use dispatch::Pacing;
pub use options::RunOptions;
pub use pool::{ExecutionPool, PoolStats, SubmitRefused, TaskHandle};

use crate::{
    error::EngineError,
    probe::{Prober, TcpProber},
    target::{Target, TargetSource, shuffle_targets},
    worker::Worker,
};

/// Identifier of one dispatched task, unique within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal classification of a task.
#[derive(Debug)]
pub enum Outcome<R> {
    /// The worker returned, possibly with no records.
    Completed(Vec<R>),
    /// The worker returned an error or panicked.
    Failed(anyhow::Error),
    /// The task ran past the configured timeout and was cut off.
    TimedOut,
}

impl<R> Outcome<R> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// A task that reached its terminal outcome.
#[derive(Debug)]
pub struct TaskReport<R> {
    pub task: TaskId,
    pub target: Target,
    pub elapsed: Duration,
    pub outcome: Outcome<R>,
}

/// One record produced for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding<R> {
    pub target: Target,
    pub record: R,
}

/// A target whose worker failed, with the rendered error chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTarget {
    pub target: Target,
    pub error: String,
}

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Options validated, pool being built.
    Initializing,
    /// Targets being dispatched and collected.
    Running,
    /// No more dispatch; waiting for in-flight tasks.
    Draining,
    /// Pool torn down. Final.
    Terminated,
}

impl Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Initializing => write!(f, "initializing"),
            EngineState::Running => write!(f, "running"),
            EngineState::Draining => write!(f, "draining"),
            EngineState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Tally of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Targets produced by the source.
    pub supplied: usize,
    /// Targets the prober reported dead.
    pub skipped: usize,
    /// Tasks handed to the pool.
    pub submitted: usize,
    /// Tasks whose worker returned.
    pub completed: usize,
    /// Records streamed to the caller.
    pub records: usize,
    pub failed: Vec<FailedTarget>,
    pub timed_out: Vec<Target>,
    /// Targets never dispatched because the run stopped first.
    pub undispatched: usize,
    /// Submitted tasks with no outcome because the run was aborted.
    pub abandoned: usize,
    /// Dispatch stopped on the first record.
    pub stopped_early: bool,
    pub pool: PoolStats,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Tasks that reached a terminal outcome.
    pub fn outcomes(&self) -> usize {
        self.completed + self.failed.len() + self.timed_out.len()
    }
}

/// Stream of findings, in completion order.
///
/// Ends once the run has drained and every finding has been delivered.
pub struct FindingStream<R> {
    inner: UnboundedReceiverStream<Finding<R>>,
}

impl<R> FindingStream<R> {
    fn new(rx: mpsc::UnboundedReceiver<Finding<R>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    pub async fn next(&mut self) -> Option<Finding<R>> {
        self.inner.next().await
    }
}

impl<R> Stream for FindingStream<R> {
    type Item = Finding<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Entry point: one worker, one prober, one set of options.
///
/// A `Hunter` can start any number of runs; each run gets its own pool.
pub struct Hunter<W: Worker> {
    worker: Arc<W>,
    prober: Arc<dyn Prober>,
    options: RunOptions,
}

impl<W: Worker> Hunter<W> {
    /// Uses default [`RunOptions`] and a [`TcpProber`] on port 445.
    pub fn new(worker: W) -> Self {
        Self {
            worker: Arc::new(worker),
            prober: Arc::new(TcpProber::default()),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_prober(mut self, prober: impl Prober) -> Self {
        self.prober = Arc::new(prober);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    /// Starts a run in the background and returns its handle.
    ///
    /// Configuration problems, an unreadable target source and a pool that
    /// cannot be built are reported here, before any task is dispatched.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, source: &dyn TargetSource) -> Result<HuntRun<W::Record>, EngineError> {
        self.options.validate()?;

        let mut targets = source.supply()?;
        let mut rng = match self.options.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        };
        shuffle_targets(&mut targets, &mut rng);

        let (state_tx, state_rx) = watch::channel(EngineState::Initializing);
        debug!(
            supplied = targets.len(),
            throttle = self.options.throttle,
            "building execution pool"
        );

        let pool = ExecutionPool::start(
            Arc::clone(&self.worker),
            self.options.throttle,
            self.options.timeout,
            self.options.close_on_timeout,
        )?;
        let (stats_tx, stats_rx) = watch::channel(pool.stats());
        let (findings_tx, findings_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        if self.options.stop_on_first_match {
            pool.stop_on_first_match(stop.clone());
        }

        let scope = RunScope {
            pool,
            state: state_tx,
            stats: stats_tx,
        };
        let plan = RunPlan {
            targets,
            prober: Arc::clone(&self.prober),
            options: self.options.clone(),
            rng,
            stop: stop.clone(),
            findings: findings_tx,
        };
        let driver = tokio::spawn(async move {
            let scope = scope;
            drive(&scope, plan).await
        });

        Ok(HuntRun {
            findings: FindingStream::new(findings_rx),
            stop,
            state: state_rx,
            stats: stats_rx,
            driver: Some(driver),
        })
    }

    /// Runs to completion and returns every finding with the summary.
    pub async fn run(
        &self,
        source: &dyn TargetSource,
    ) -> Result<(Vec<Finding<W::Record>>, RunSummary), EngineError> {
        let mut run = self.start(source)?;
        let mut findings = Vec::new();
        while let Some(finding) = run.next().await {
            findings.push(finding);
        }
        let summary = run.finish().await?;
        Ok((findings, summary))
    }
}

/// Handle on a running hunt.
///
/// Dropping the handle aborts the run.
pub struct HuntRun<R> {
    findings: FindingStream<R>,
    stop: CancellationToken,
    state: watch::Receiver<EngineState>,
    stats: watch::Receiver<PoolStats>,
    driver: Option<JoinHandle<Result<RunSummary, EngineError>>>,
}

impl<R> HuntRun<R> {
    /// Next finding, or `None` once the run has drained.
    pub async fn next(&mut self) -> Option<Finding<R>> {
        self.findings.next().await
    }

    pub fn findings(&mut self) -> &mut FindingStream<R> {
        &mut self.findings
    }

    /// Stops dispatching new targets. Running tasks still finish.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token fired by [`stop`](Self::stop), for wiring up external signals.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Waits for the run to reach [`EngineState::Terminated`].
    pub async fn terminated(&mut self) {
        // A closed channel also means the driver is gone.
        self.state
            .wait_for(|state| *state == EngineState::Terminated)
            .await
            .ok();
    }

    /// Latest pool snapshot published by the aggregator.
    pub fn stats(&self) -> PoolStats {
        *self.stats.borrow()
    }

    /// Waits for the run to end and returns its summary.
    ///
    /// Findings not consumed yet are discarded.
    pub async fn finish(mut self) -> Result<RunSummary, EngineError> {
        let Some(driver) = self.driver.take() else {
            return Err(EngineError::Join("run already finished".to_string()));
        };
        match driver.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Join(e.to_string())),
        }
    }

    /// Tears the pool down immediately and waits until it is gone.
    pub async fn abort(mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            driver.await.ok();
        }
        info!("hunt aborted");
    }
}

impl<R> Drop for HuntRun<R> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Owns the pool for the length of a run.
///
/// Dropping it shuts the pool down first, then publishes `Terminated`, on
/// whichever path the driver leaves.
struct RunScope<W: Worker> {
    pool: ExecutionPool<W>,
    state: watch::Sender<EngineState>,
    stats: watch::Sender<PoolStats>,
}

impl<W: Worker> Drop for RunScope<W> {
    fn drop(&mut self) {
        self.pool.shutdown();
        self.stats.send_replace(self.pool.stats());
        self.state.send_replace(EngineState::Terminated);
        debug!("hunt terminated");
    }
}

/// Inputs the driver consumes.
struct RunPlan<R> {
    targets: Vec<Target>,
    prober: Arc<dyn Prober>,
    options: RunOptions,
    rng: SmallRng,
    stop: CancellationToken,
    findings: mpsc::UnboundedSender<Finding<R>>,
}

async fn drive<W: Worker>(
    scope: &RunScope<W>,
    plan: RunPlan<W::Record>,
) -> Result<RunSummary, EngineError> {
    let RunPlan {
        targets,
        prober,
        options,
        mut rng,
        stop,
        findings,
    } = plan;

    let started = Instant::now();
    let supplied = targets.len();
    scope.state.send_replace(EngineState::Running);
    info!(supplied, throttle = options.throttle, "hunt running");

    let (handles_tx, handles_rx) = mpsc::unbounded_channel();
    let (tally, collected) = tokio::join!(
        dispatch::dispatch_loop(
            &scope.pool,
            targets,
            prober.as_ref(),
            &options,
            &mut rng,
            &stop,
            handles_tx,
        ),
        aggregate::collect(
            &scope.pool,
            handles_rx,
            findings,
            &options,
            &stop,
            &scope.state,
            &scope.stats,
        ),
    );

    let pool = scope.pool.stats();
    let abandoned = tally.submitted.saturating_sub(collected.terminal());
    let summary = RunSummary {
        supplied,
        skipped: tally.skipped,
        submitted: tally.submitted,
        completed: collected.completed,
        records: collected.records,
        failed: collected.failed,
        timed_out: collected.timed_out,
        undispatched: tally.undispatched,
        abandoned,
        stopped_early: collected.stopped_early,
        pool,
        elapsed: started.elapsed(),
    };

    match collected.fault {
        Some(fault) => {
            error!(error = %fault, abandoned, "hunt aborted by a pool fault");
            Err(EngineError::Aborted {
                reason: fault.to_string(),
                summary: Box::new(summary),
            })
        }
        None => {
            info!(
                supplied = summary.supplied,
                submitted = summary.submitted,
                records = summary.records,
                failed = summary.failed.len(),
                timed_out = summary.timed_out.len(),
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "hunt finished"
            );
            Ok(summary)
        }
    }
}
