//! Error types surfaced by the engine.
//!
//! Only configuration problems and execution-pool faults terminate a run.
//! Everything a [`Worker`](crate::worker::Worker) does wrong is folded into an
//! [`Outcome`](crate::engine::Outcome) instead and never reaches this type.
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::RunSummary;

/// Terminating errors of a hunt.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `throttle` must allow at least one concurrent task.
    #[error("invalid throttle {0} => must be greater than 0")]
    InvalidThrottle(usize),

    /// `jitter` is a proportion and must stay within `0.0..=1.0`.
    #[error("invalid jitter {0} => must be within 0.0 and 1.0")]
    InvalidJitter(f64),

    /// The aggregator cannot poll with a zero interval.
    #[error("invalid poll interval => must be greater than 0")]
    InvalidPollInterval,

    /// The configured target file does not exist.
    #[error("target file not found: {}", path.display())]
    TargetFileMissing { path: PathBuf },

    /// The target file exists but could not be read.
    #[error("failed to read target file {}: {source}", path.display())]
    TargetFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The target supplier itself failed (directory query, custom source, ...).
    #[error("target supplier failed: {0:#}")]
    Supplier(anyhow::Error),

    /// An execution context could not be built.
    #[error("failed to construct execution context: {0:#}")]
    ContextConstruction(anyhow::Error),

    /// The run stopped early because of a pool fault.
    ///
    /// Findings already streamed stay valid, `summary` holds the partial tally.
    #[error("hunt aborted: {reason}")]
    Aborted {
        reason: String,
        summary: Box<RunSummary>,
    },

    /// The driver task was cancelled or panicked.
    #[error("hunt driver terminated unexpectedly: {0}")]
    Join(String),
}

impl EngineError {
    /// Returns `true` for errors raised before any task was dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidThrottle(_)
                | Self::InvalidJitter(_)
                | Self::InvalidPollInterval
                | Self::TargetFileMissing { .. }
                | Self::TargetFile { .. }
                | Self::Supplier(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            EngineError::InvalidThrottle(0).to_string(),
            "invalid throttle 0 => must be greater than 0"
        );
        assert_eq!(
            EngineError::TargetFileMissing {
                path: PathBuf::from("/nope/hosts.txt")
            }
            .to_string(),
            "target file not found: /nope/hosts.txt"
        );
    }

    #[test]
    fn test_error_configuration_classes() {
        assert!(EngineError::InvalidThrottle(0).is_configuration());
        assert!(EngineError::InvalidJitter(1.5).is_configuration());
        assert!(!EngineError::ContextConstruction(anyhow::anyhow!("boom")).is_configuration());
        assert!(!EngineError::Join("cancelled".to_string()).is_configuration());
    }
}
