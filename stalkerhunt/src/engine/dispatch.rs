//! Dispatch loop: probe, pace, submit.
//!
//! Walks the shuffled targets one by one. Stopping is pull-based: the stop
//! token is checked between targets and while waiting on a pause or a pool
//! slot. There is no retry; a failing worker is the aggregator's business.
use std::time::Duration;

use rand::Rng;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    options::RunOptions,
    pool::{ExecutionPool, SubmitRefused, TaskHandle},
};
use crate::{probe::Prober, target::Target, worker::Worker};

/// Randomised pause between two dispatches.
///
/// Samples uniformly from `[delay * (1 - jitter), delay * (1 + jitter)]` so
/// dispatches do not follow a fixed period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    delay: Duration,
    jitter: f64,
}

impl Pacing {
    pub fn new(delay: Duration, jitter: f64) -> Self {
        Self {
            delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        let base = self.delay.as_secs_f64();
        (
            Duration::from_secs_f64(base * (1.0 - self.jitter)),
            Duration::from_secs_f64(base * (1.0 + self.jitter)),
        )
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.delay.is_zero() || self.jitter == 0.0 {
            return self.delay;
        }
        let base = self.delay.as_secs_f64();
        let secs = rng.random_range(base * (1.0 - self.jitter)..=base * (1.0 + self.jitter));
        Duration::from_secs_f64(secs)
    }
}

impl From<&RunOptions> for Pacing {
    fn from(options: &RunOptions) -> Self {
        Self::new(options.delay, options.jitter)
    }
}

/// What the dispatch loop did with the supplied targets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct DispatchTally {
    /// Targets the prober reported dead.
    pub skipped: usize,
    /// Targets handed to the pool.
    pub submitted: usize,
    /// Targets never reached because dispatch stopped.
    pub undispatched: usize,
}

/// Runs until the targets are exhausted, the stop token fires or the pool
/// refuses work. Dropping `handles` on return tells the aggregator that no
/// more tasks are coming.
pub(crate) async fn dispatch_loop<W, R>(
    pool: &ExecutionPool<W>,
    targets: Vec<Target>,
    prober: &dyn Prober,
    options: &RunOptions,
    rng: &mut R,
    stop: &CancellationToken,
    handles: mpsc::UnboundedSender<TaskHandle>,
) -> DispatchTally
where
    W: Worker,
    R: Rng + Send + ?Sized,
{
    let pacing = Pacing::from(options);
    let total = targets.len();
    let mut tally = DispatchTally::default();

    for (index, target) in targets.into_iter().enumerate() {
        if stop.is_cancelled() {
            tally.undispatched = total - index;
            break;
        }

        if options.probe && !prober.is_alive(&target).await {
            debug!(%target, "target did not answer the probe, skipping");
            tally.skipped += 1;
            continue;
        }

        let pause = pacing.sample(rng);
        if !pause.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => {
                    tally.undispatched = total - index;
                    break;
                }
                _ = sleep(pause) => {}
            }
        }

        match pool.submit(target, stop).await {
            Ok(handle) => {
                tally.submitted += 1;
                handles.send(handle).ok();
            }
            Err(SubmitRefused::Stopped) => {
                tally.undispatched = total - index;
                break;
            }
            Err(SubmitRefused::Exhausted) => {
                warn!(
                    remaining = total - index,
                    "no execution context left, dispatch stopped"
                );
                tally.undispatched = total - index;
                break;
            }
        }
    }

    debug!(?tally, "dispatch finished");
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn close_to(a: Duration, b: Duration) -> bool {
        a.abs_diff(b) < Duration::from_micros(1)
    }

    #[test]
    fn test_pacing_default_jitter_bounds() {
        let pacing = Pacing::new(Duration::from_millis(1_000), 0.3);
        let mut rng = SmallRng::seed_from_u64(1);

        let (lo, hi) = pacing.bounds();
        assert!(close_to(lo, Duration::from_millis(700)));
        assert!(close_to(hi, Duration::from_millis(1_300)));

        let mut below_base = 0;
        for _ in 0..10_000 {
            let pause = pacing.sample(&mut rng);
            assert!(pause >= Duration::from_millis(699) && pause <= Duration::from_millis(1_301));
            if pause < Duration::from_millis(1_000) {
                below_base += 1;
            }
        }
        // Symmetric around the base delay.
        assert!((4_000..=6_000).contains(&below_base));
    }

    #[test]
    fn test_pacing_zero_delay_never_sleeps() {
        let pacing = Pacing::new(Duration::ZERO, 0.3);
        let mut rng = SmallRng::seed_from_u64(2);
        assert_eq!(pacing.sample(&mut rng), Duration::ZERO);
    }

    #[test]
    fn test_pacing_without_jitter_is_fixed() {
        let pacing = Pacing::new(Duration::from_millis(250), 0.0);
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(pacing.sample(&mut rng), Duration::from_millis(250));
    }

    #[test]
    fn test_pacing_from_options() {
        let options = RunOptions::default().with_delay(Duration::from_secs(2), 0.5);
        let (lo, hi) = Pacing::from(&options).bounds();
        assert!(close_to(lo, Duration::from_secs(1)));
        assert!(close_to(hi, Duration::from_secs(3)));
    }
}
