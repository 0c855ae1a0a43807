//! # StalkerHunt
//!
//! A bounded-concurrency remote enumeration engine for building network
//! hunting tools.
//!
//! A hunt dispatches one operation (a [`Worker`](worker::Worker)) against an
//! unordered set of target hosts, with:
//!
//! - a fixed concurrency ceiling (the throttle)
//! - an optional liveness check before a slot is spent (a [`Prober`](probe::Prober))
//! - a per-task timeout that tears hung contexts down or abandons them
//! - randomized pacing between dispatches
//! - records streamed to the caller as soon as a task finishes
//! - optional stop on the first match
//!
//! ## Features
//!
//! - **Target sources** - literal lists, target files, or any closure
//! - **Reusable execution contexts** - one worker session per context, built once
//! - **Ready-made hunters** - TCP port sweep, banner grab, name resolution
//! - **Reports** - plain text and JSON formatters for findings and summaries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stalkerhunt::{
//!     engine::{Hunter, RunOptions},
//!     hunters::BannerHunter,
//!     target::TargetFile,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hunter = Hunter::new(BannerHunter::new(22)).with_options(
//!         RunOptions::default()
//!             .with_throttle(10)
//!             .with_timeout(Duration::from_secs(5))
//!             .with_delay(Duration::from_millis(200), 0.3),
//!     );
//!
//!     let mut run = hunter.start(&TargetFile::new("hosts.txt"))?;
//!     while let Some(finding) = run.next().await {
//!         println!("{}: {}", finding.target, finding.record);
//!     }
//!
//!     let summary = run.finish().await?;
//!     eprintln!("{} failed, {} timed out", summary.failed.len(), summary.timed_out.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`target`** - target type and sources
//! - **`probe`** - liveness checks
//! - **`worker`** - the per-target operation contract
//! - **`engine`** - execution pool, dispatch loop, aggregator and the run handle
//! - **`hunters`** - concrete workers
//! - **`report`** - output formatting
//! - **`error`** - terminating errors
//!
//! ## Error Handling
//!
//! Only configuration problems and pool faults end a run with an
//! [`EngineError`](error::EngineError). A worker that fails, panics or hangs
//! only fails its own target:
//!
//! ```rust,no_run
//! # use stalkerhunt::{engine::{Hunter, RunOptions}, error::EngineError, hunters::ResolveHunter, target::TargetList};
//! # async fn demo() {
//! let hunter = Hunter::new(ResolveHunter).with_options(RunOptions::default().with_throttle(0));
//! match hunter.start(&TargetList::new(["dc01.corp.local"])) {
//!     Err(e) if e.is_configuration() => eprintln!("bad configuration: {e}"),
//!     Err(e) => eprintln!("hunt failed: {e}"),
//!     Ok(_run) => {}
//! }
//! # }
//! ```
//!
//! ## License
//!
//! This project is licensed under the MIT License.

pub mod error;

pub mod target;

pub mod probe;

pub mod worker;

pub mod engine;

pub mod hunters;

pub mod report;
