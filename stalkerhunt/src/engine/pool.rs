//! # Execution Pool
//!
//! A fixed set of reusable execution contexts, each one a long-lived Tokio
//! task holding its own worker session. Contexts are built once when the pool
//! starts and are handed one task at a time.
//!
//! ```text
//!  submit() --permit--> free context --job--> context loop --> worker.run()
//!      ^                                              |
//!      |                                              v
//!  add_permits(1) <---- context back to free <---- complete()
//! ```
//!
//! ## Bookkeeping
//!
//! - the slot `Semaphore` holds one permit per idle context; permits are
//!   forgotten on submit and handed back explicitly once the context is idle
//!   again, so a permit never exists without a free context behind it
//! - `busy` maps each running task to the context it occupies
//! - `finished` holds terminal outcomes until [`ExecutionPool::poll`] takes them
//!
//! ## Timeouts
//!
//! A task past its deadline is reported as [`Outcome::TimedOut`] by `poll`.
//! The context it occupied is then either aborted and replaced with a fresh
//! one (`close_on_timeout`), or abandoned: it keeps running detached, is never
//! reused, and the pool shrinks by one slot for the rest of the run. When every
//! slot has been abandoned the semaphore is closed so submitters stop waiting.
//!
//! [`ExecutionPool::shutdown`], also run on drop, aborts every context,
//! abandoned ones included.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Outcome, TaskId, TaskReport};
use crate::{error::EngineError, target::Target, worker::Worker};

type ContextId = usize;

/// A task handed to a context.
struct Job {
    task: TaskId,
    target: Target,
}

/// Pool-side handle of one execution context.
struct Context {
    id: ContextId,
    jobs: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

struct Busy {
    target: Target,
    started: Instant,
    context: Context,
}

struct PoolState<R> {
    free: Vec<Context>,
    busy: HashMap<TaskId, Busy>,
    finished: HashMap<TaskId, TaskReport<R>>,
    abandoned: Vec<JoinHandle<()>>,
    next_context: ContextId,
}

/// Counters sampled while the pool runs.
#[derive(Debug, Default)]
struct PoolMetrics {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    submitted: AtomicUsize,
    leaked: AtomicUsize,
    rebuilt: AtomicUsize,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Contexts the pool was built with (the throttle).
    pub capacity: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Highest `running` value seen so far.
    pub peak_running: usize,
    /// Idle contexts ready for a task.
    pub available: usize,
    /// Contexts abandoned after a timeout.
    pub leaked: usize,
    /// Contexts replaced after a timeout or a worker panic.
    pub rebuilt: usize,
    /// Tasks handed to the pool.
    pub submitted: usize,
}

/// State shared between the pool front-end and its contexts.
struct Shared<W: Worker> {
    worker: Arc<W>,
    slots: Semaphore,
    state: Mutex<PoolState<W::Record>>,
    metrics: PoolMetrics,
    capacity: usize,
    /// First fault raised from inside a context.
    fault: Mutex<Option<EngineError>>,
    /// Cancelled by the first task that completes with a record.
    match_stop: Mutex<Option<CancellationToken>>,
    stopped_on_match: AtomicBool,
}

/// Returned by [`ExecutionPool::submit`] for a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: TaskId,
    pub target: Target,
}

/// Why a submission did not produce a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRefused {
    /// The stop token fired while waiting for a slot.
    Stopped,
    /// Every context was abandoned; the pool cannot run anything anymore.
    Exhausted,
}

/// Bounded set of reusable execution contexts running one [`Worker`].
pub struct ExecutionPool<W: Worker> {
    shared: Arc<Shared<W>>,
    timeout: Option<Duration>,
    close_on_timeout: bool,
    next_task: AtomicU64,
}

impl<W: Worker> ExecutionPool<W> {
    /// Builds `capacity` contexts, opening one worker session each.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        worker: Arc<W>,
        capacity: usize,
        timeout: Option<Duration>,
        close_on_timeout: bool,
    ) -> Result<Self, EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidThrottle(capacity));
        }

        let shared = Arc::new(Shared {
            worker,
            slots: Semaphore::new(0),
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                busy: HashMap::new(),
                finished: HashMap::new(),
                abandoned: Vec::new(),
                next_context: 0,
            }),
            metrics: PoolMetrics::default(),
            capacity,
            fault: Mutex::new(None),
            match_stop: Mutex::new(None),
            stopped_on_match: AtomicBool::new(false),
        });

        // On error the contexts built so far are aborted by `Drop`.
        let pool = Self {
            shared,
            timeout,
            close_on_timeout,
            next_task: AtomicU64::new(0),
        };

        for _ in 0..capacity {
            let context = Shared::spawn_context(&pool.shared)?;
            pool.shared.release(context);
        }

        debug!(capacity, "execution pool ready");
        Ok(pool)
    }

    /// Hands `target` to a free context, waiting while the pool is saturated.
    pub async fn submit(
        &self,
        target: Target,
        stop: &CancellationToken,
    ) -> Result<TaskHandle, SubmitRefused> {
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(SubmitRefused::Stopped),
            permit = self.shared.slots.acquire() => permit.map_err(|_| SubmitRefused::Exhausted)?,
        };
        permit.forget();

        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        let mut state = self.shared.state.lock();

        let Some(context) = state.free.pop() else {
            // A permit always has a free context behind it.
            drop(state);
            self.shared.slots.add_permits(1);
            error!(task = %id, "no free context behind an acquired slot");
            return Err(SubmitRefused::Exhausted);
        };

        let job = Job {
            task: id,
            target: target.clone(),
        };
        let sent = context.jobs.try_send(job);

        state.busy.insert(
            id,
            Busy {
                target: target.clone(),
                started: Instant::now(),
                context,
            },
        );

        let metrics = &self.shared.metrics;
        let running = metrics.running.fetch_add(1, Ordering::SeqCst) + 1;
        metrics.peak_running.fetch_max(running, Ordering::SeqCst);
        metrics.submitted.fetch_add(1, Ordering::SeqCst);
        drop(state);

        if sent.is_err() {
            // The context loop is gone; fail the task and put a new context in its place.
            self.shared.complete(
                id,
                Err(anyhow::anyhow!("execution context unavailable")),
                None,
            );
        }

        debug!(task = %id, %target, "task submitted");
        Ok(TaskHandle { id, target })
    }

    /// Returns the terminal report of `handle`, or `None` while it still runs.
    ///
    /// This is where per-task timeouts are enforced. If a torn down context
    /// cannot be rebuilt the fault is kept for [`take_fault`](Self::take_fault).
    pub fn poll(&self, handle: &TaskHandle) -> Option<TaskReport<W::Record>> {
        let mut state = self.shared.state.lock();

        if let Some(report) = state.finished.remove(&handle.id) {
            return Some(report);
        }

        let timeout = self.timeout?;
        let expired = state
            .busy
            .get(&handle.id)
            .is_some_and(|busy| busy.started.elapsed() >= timeout);
        if !expired {
            return None;
        }

        let busy = state.busy.remove(&handle.id)?;
        self.shared.metrics.running.fetch_sub(1, Ordering::SeqCst);

        let report = TaskReport {
            task: handle.id,
            target: busy.target,
            elapsed: busy.started.elapsed(),
            outcome: Outcome::TimedOut,
        };

        if self.close_on_timeout {
            drop(state);
            busy.context.handle.abort();
            self.shared.replace_context(busy.context.id);
        } else {
            // The sender drops here, so the context loop exits if the hung call ever returns.
            state.abandoned.push(busy.context.handle);
            drop(state);
            let leaked = self.shared.metrics.leaked.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                task = %handle.id,
                context = busy.context.id,
                leaked,
                "timed out context abandoned, pool capacity reduced"
            );
            if leaked >= self.shared.capacity {
                self.shared.slots.close();
            }
        }

        Some(report)
    }

    /// Waits until `handle` reaches a terminal outcome, checking every `interval`.
    pub async fn wait(&self, handle: &TaskHandle, interval: Duration) -> TaskReport<W::Record> {
        loop {
            if let Some(report) = self.poll(handle) {
                return report;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Cancels `stop` as soon as a task completes with at least one record.
    ///
    /// The token fires before the task's context is handed back, so a
    /// submitter waiting for that slot sees the stop instead of the slot.
    pub fn stop_on_first_match(&self, stop: CancellationToken) {
        *self.shared.match_stop.lock() = Some(stop);
    }

    /// Whether the pool itself cancelled the match token.
    pub fn stopped_on_match(&self) -> bool {
        self.shared.stopped_on_match.load(Ordering::SeqCst)
    }

    /// Takes the first fault raised inside a context, if any.
    pub fn take_fault(&self) -> Option<EngineError> {
        self.shared.fault.lock().take()
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.shared.state.lock().free.len();
        let metrics = &self.shared.metrics;
        PoolStats {
            capacity: self.shared.capacity,
            running: metrics.running.load(Ordering::SeqCst),
            peak_running: metrics.peak_running.load(Ordering::SeqCst),
            available,
            leaked: metrics.leaked.load(Ordering::SeqCst),
            rebuilt: metrics.rebuilt.load(Ordering::SeqCst),
            submitted: metrics.submitted.load(Ordering::SeqCst),
        }
    }
}

impl<W: Worker> ExecutionPool<W> {
    /// Closes the pool and aborts every context, abandoned ones included.
    ///
    /// Tasks still running never report. Calling it twice is harmless.
    pub fn shutdown(&self) {
        self.shared.slots.close();
        let mut state = self.shared.state.lock();
        for context in state.free.drain(..) {
            context.handle.abort();
        }
        for (_, busy) in state.busy.drain() {
            busy.context.handle.abort();
            self.shared.metrics.running.fetch_sub(1, Ordering::SeqCst);
        }
        for handle in state.abandoned.drain(..) {
            handle.abort();
        }
        debug!("execution pool torn down");
    }
}

impl<W: Worker> Drop for ExecutionPool<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<W: Worker> Shared<W> {
    /// Opens a session and spawns a context loop around it.
    fn spawn_context(shared: &Arc<Self>) -> Result<Context, EngineError> {
        let session = shared
            .worker
            .open_session()
            .map_err(EngineError::ContextConstruction)?;

        let id = {
            let mut state = shared.state.lock();
            state.next_context += 1;
            state.next_context
        };

        let (jobs, rx) = mpsc::channel(1);
        let handle = tokio::spawn(context_loop(id, session, rx, Arc::clone(shared)));

        Ok(Context { id, jobs, handle })
    }

    /// Puts an idle context back and frees its slot.
    ///
    /// Once the slots are closed the context is aborted instead.
    fn release(&self, context: Context) {
        let mut state = self.state.lock();
        if self.slots.is_closed() {
            context.handle.abort();
            return;
        }
        state.free.push(context);
        drop(state);
        self.slots.add_permits(1);
    }

    /// Records the result of `task`.
    ///
    /// `context` is `Some` when the context that ran the task is still usable.
    /// Results for tasks already reported as timed out are dropped.
    fn complete(
        self: &Arc<Self>,
        task: TaskId,
        result: anyhow::Result<Vec<W::Record>>,
        context: Option<ContextId>,
    ) {
        let mut state = self.state.lock();
        let Some(busy) = state.busy.remove(&task) else {
            return;
        };
        self.metrics.running.fetch_sub(1, Ordering::SeqCst);

        let outcome = match result {
            Ok(records) => {
                if !records.is_empty() {
                    self.signal_match(&busy.target);
                }
                Outcome::Completed(records)
            }
            Err(e) => Outcome::Failed(e),
        };
        let report = TaskReport {
            task,
            target: busy.target,
            elapsed: busy.started.elapsed(),
            outcome,
        };

        match context {
            Some(id) if id == busy.context.id => {
                state.finished.insert(task, report);
                drop(state);
                self.release(busy.context);
            }
            _ => {
                // A rebuild fault must be visible before the report is.
                drop(state);
                busy.context.handle.abort();
                self.replace_context(busy.context.id);
                self.state.lock().finished.insert(task, report);
            }
        }
    }

    fn signal_match(&self, target: &Target) {
        let guard = self.match_stop.lock();
        let Some(stop) = guard.as_ref() else {
            return;
        };
        if !stop.is_cancelled() {
            info!(%target, "first match found, no further targets will be dispatched");
            self.stopped_on_match.store(true, Ordering::SeqCst);
            stop.cancel();
        }
    }

    /// Builds a context in place of `old` and frees its slot.
    ///
    /// On failure the slot is lost and the fault recorded; the pool refuses
    /// further submissions.
    fn replace_context(self: &Arc<Self>, old: ContextId) {
        if self.slots.is_closed() {
            return;
        }
        match Shared::spawn_context(self) {
            Ok(fresh) => {
                debug!(old, new = fresh.id, "execution context replaced");
                self.metrics.rebuilt.fetch_add(1, Ordering::SeqCst);
                self.release(fresh);
            }
            Err(e) => {
                error!(context = old, error = %e, "failed to rebuild execution context");
                self.fault.lock().get_or_insert(e);
                self.slots.close();
            }
        }
    }
}

/// Body of one execution context.
///
/// Each job runs in its own inner task so a panicking worker only fails that
/// task. The inner task is aborted together with the context.
async fn context_loop<W: Worker>(
    id: ContextId,
    mut session: W::Session,
    mut jobs: mpsc::Receiver<Job>,
    shared: Arc<Shared<W>>,
) {
    while let Some(job) = jobs.recv().await {
        let worker = Arc::clone(&shared.worker);
        let target = job.target;

        let run = AbortOnDrop(tokio::spawn(async move {
            let result = worker.run(&mut session, &target).await;
            (session, result)
        }));

        match run.join().await {
            Ok((returned, result)) => {
                session = returned;
                shared.complete(job.task, result, Some(id));
            }
            Err(e) => {
                warn!(task = %job.task, context = id, error = %e, "worker panicked");
                // The session went down with the panic; hand the task back
                // without a context so a fresh one replaces this loop.
                shared.complete(job.task, Err(anyhow::anyhow!("worker panicked")), None);
                return;
            }
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
