use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};
use tracing::trace;

use super::{HuntRecord, resolve};
use crate::{target::Target, worker::Worker};

/// TCP connect sweep: one [`HuntRecord::OpenPort`] per port accepting a
/// handshake.
///
/// Closed, filtered and timed out ports produce nothing. Only a target that
/// cannot be resolved fails.
#[derive(Debug, Clone)]
pub struct PortHunter {
    ports: Vec<u16>,
    connect_timeout: Duration,
}

impl PortHunter {
    pub fn new(ports: Vec<u16>) -> Self {
        Self {
            ports,
            connect_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}

#[async_trait]
impl Worker for PortHunter {
    type Session = ();
    type Record = HuntRecord;

    fn open_session(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, _session: &mut (), target: &Target) -> anyhow::Result<Vec<HuntRecord>> {
        let ip = resolve(target).await?[0];
        let mut records = Vec::new();

        for &port in &self.ports {
            let addr = SocketAddr::new(ip, port);
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => records.push(HuntRecord::OpenPort { port }),
                Ok(Err(e)) => trace!(%target, port, error = %e, "port closed"),
                Err(_elapsed) => trace!(%target, port, "port filtered"),
            }
        }

        Ok(records)
    }
}
