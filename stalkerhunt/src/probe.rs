//! Liveness checks run by the dispatch loop before a pool slot is spent.
//!
//! Probers run serially inside the dispatch loop, so they must return
//! promptly: no unbounded retries, and any network wait needs its own timeout.
use std::{io::ErrorKind, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};
use tracing::trace;

use crate::target::Target;

/// Decides whether a target is worth a task.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn is_alive(&self, target: &Target) -> bool;
}

/// Treats every target as alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeAlive;

#[async_trait]
impl Prober for AssumeAlive {
    async fn is_alive(&self, _target: &Target) -> bool {
        true
    }
}

/// TCP handshake probe.
///
/// A completed handshake or a refused connection both prove the host is up.
/// Timeouts, unreachable networks and unresolvable names count as dead.
#[derive(Debug, Clone)]
pub struct TcpProber {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TcpProber {
    fn default() -> Self {
        Self {
            port: 445,
            timeout: Duration::from_millis(500),
        }
    }
}

impl TcpProber {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn is_alive(&self, target: &Target) -> bool {
        match timeout(self.timeout, TcpStream::connect((target.host(), self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => true,
            Ok(Err(e)) => {
                trace!(%target, error = %e, "probe connect failed");
                false
            }
            Err(_elapsed) => false,
        }
    }
}

/// Adapts a synchronous predicate into a [`Prober`].
pub struct FnProber<F>(pub F);

#[async_trait]
impl<F> Prober for FnProber<F>
where
    F: Fn(&Target) -> bool + Send + Sync + 'static,
{
    async fn is_alive(&self, target: &Target) -> bool {
        (self.0)(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_assume_alive() {
        assert!(AssumeAlive.is_alive(&Target::new("anything")).await);
    }

    #[tokio::test]
    async fn test_fn_prober() {
        let prober = FnProber(|t: &Target| t.as_str().starts_with("dc"));
        assert!(prober.is_alive(&Target::new("dc01")).await);
        assert!(!prober.is_alive(&Target::new("ws01")).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcp_prober_open_port_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = TcpProber::new(port, Duration::from_millis(500));
        assert!(prober.is_alive(&Target::new("127.0.0.1")).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tcp_prober_refused_is_alive() {
        // Bind then drop to get a port that nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let prober = TcpProber::new(port, Duration::from_millis(500));
        assert!(prober.is_alive(&Target::new("127.0.0.1")).await);
    }

    #[tokio::test]
    async fn test_tcp_prober_unresolvable_is_dead() {
        let prober = TcpProber::new(445, Duration::from_millis(500));
        assert!(!prober.is_alive(&Target::new("no such host!")).await);
    }
}
