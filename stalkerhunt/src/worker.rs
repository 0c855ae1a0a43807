//! The per-target operation run by the execution pool.
//!
//! # Execution flow
//!
//! Each execution context calls [`Worker::open_session`] once when it is built
//! and keeps the session for every task it runs afterwards. A session is the
//! place for anything expensive to set up (buffers, authenticated handles,
//! connection state). When a context is torn down the session is dropped with
//! it, so native resources must release themselves in `Drop`.
//!
//! [`Worker::run`] is then called once per target with that session.
//!
//! # Example
//! ```rust,ignore
//! use stalkerhunt::worker::FnWorker;
//!
//! struct Shares { names: Vec<String> }
//!
//! let worker = FnWorker::new(Shares { names: vec!["ADMIN$".into()] }, |target, params| {
//!     Box::pin(async move { Ok(params.names.iter().map(|n| format!("\\\\{target}\\{n}")).collect()) })
//! });
//! ```
use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;

use crate::target::Target;

/// A caller-supplied enumeration operation.
///
/// # Threading
/// One `Worker` value is shared by every context through an `Arc`, so
/// [`run`](Worker::run) may execute concurrently for different targets. Only
/// the session is exclusive to one context.
///
/// Workers must not rely on target order or on other targets being processed.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Per-context state, built once and reused across tasks.
    type Session: Send + 'static;
    /// Record produced for a target; opaque to the engine.
    type Record: Send + 'static;

    /// Builds the state of one execution context.
    ///
    /// A failure here is a pool fault and terminates the run.
    fn open_session(&self) -> anyhow::Result<Self::Session>;

    /// Enumerates one target.
    ///
    /// Errors stay local to the task and are reported as a failed outcome.
    async fn run(
        &self,
        session: &mut Self::Session,
        target: &Target,
    ) -> anyhow::Result<Vec<Self::Record>>;
}

/// Boxed future returned by [`FnWorker`] closures.
pub type WorkerFuture<R> = Pin<Box<dyn Future<Output = anyhow::Result<Vec<R>>> + Send>>;

/// A [`Worker`] built from a closure and a set of constant parameters.
///
/// The parameters sit behind one `Arc` and are handed to every invocation
/// without being copied.
pub struct FnWorker<P, F> {
    params: Arc<P>,
    f: F,
}

impl<P, F> FnWorker<P, F> {
    pub fn new(params: P, f: F) -> Self {
        Self {
            params: Arc::new(params),
            f,
        }
    }

    pub fn params(&self) -> &Arc<P> {
        &self.params
    }
}

#[async_trait]
impl<P, F, R> Worker for FnWorker<P, F>
where
    P: Send + Sync + 'static,
    F: Fn(Target, Arc<P>) -> WorkerFuture<R> + Send + Sync + 'static,
    R: Send + 'static,
{
    type Session = ();
    type Record = R;

    fn open_session(&self) -> anyhow::Result<Self::Session> {
        Ok(())
    }

    async fn run(&self, _session: &mut (), target: &Target) -> anyhow::Result<Vec<R>> {
        (self.f)(target.clone(), self.params.clone()).await
    }
}
