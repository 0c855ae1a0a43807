//! Run configuration.
//!
//! [`RunOptions`] is fixed when a hunt starts and shared read-only by the
//! dispatch loop, the aggregator and every execution context.
use std::time::Duration;

use crate::error::EngineError;

/// Runtime configuration for one hunt.
///
/// # Defaults
/// ```rust,ignore
/// RunOptions {
///     throttle: 20,
///     timeout: None,
///     delay: Duration::ZERO,
///     jitter: 0.3,
///     probe: true,
///     stop_on_first_match: false,
///     close_on_timeout: true,
///     poll_interval: Duration::from_millis(100),
///     seed: None,
/// }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    /// Maximum number of tasks running at the same time.
    pub throttle: usize,
    /// Per-task ceiling. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Base pause between two dispatches.
    pub delay: Duration,
    /// Proportional spread applied to `delay` (`0.3` = +/-30%).
    pub jitter: f64,
    /// Check liveness with the prober before committing a pool slot.
    pub probe: bool,
    /// Stop dispatching once any task yields a record.
    pub stop_on_first_match: bool,
    /// Tear down and rebuild a context whose task timed out.
    ///
    /// When `false` the hung context is abandoned in place and the pool
    /// permanently loses one slot for the rest of the run.
    pub close_on_timeout: bool,
    /// How often the aggregator scans outstanding tasks.
    pub poll_interval: Duration,
    /// Seed for the shuffle and the pacing jitter. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            throttle: 20,
            timeout: None,
            delay: Duration::ZERO,
            jitter: 0.3,
            probe: true,
            stop_on_first_match: false,
            close_on_timeout: true,
            poll_interval: Duration::from_millis(100),
            seed: None,
        }
    }
}

impl RunOptions {
    pub fn with_throttle(mut self, throttle: usize) -> Self {
        self.throttle = throttle;
        self
    }

    /// A zero duration means unbounded, same as `None`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_delay(mut self, delay: Duration, jitter: f64) -> Self {
        self.delay = delay;
        self.jitter = jitter;
        self
    }

    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_stop_on_first_match(mut self, stop: bool) -> Self {
        self.stop_on_first_match = stop;
        self
    }

    pub fn with_close_on_timeout(mut self, close: bool) -> Self {
        self.close_on_timeout = close;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Rejects configurations that cannot start a run.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.throttle == 0 {
            return Err(EngineError::InvalidThrottle(self.throttle));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(EngineError::InvalidJitter(self.jitter));
        }
        if self.poll_interval.is_zero() {
            return Err(EngineError::InvalidPollInterval);
        }
        Ok(())
    }
}
