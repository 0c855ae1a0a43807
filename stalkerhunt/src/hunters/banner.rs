use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::trace;

use super::{HuntRecord, buffer::ReadBuffer, resolve};
use crate::{target::Target, worker::Worker};

/// Banner grab on one port.
///
/// Connects, optionally writes a greeting, then performs a single read into
/// the context's [`ReadBuffer`]. Services that stay silent past the read
/// timeout, closed ports and filtered ports produce no record.
#[derive(Debug, Clone)]
pub struct BannerHunter {
    port: u16,
    greeting: Option<Vec<u8>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl BannerHunter {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            greeting: None,
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(2),
        }
    }

    /// Bytes sent right after the handshake, for services that wait for the
    /// client to speak first (`HEAD / HTTP/1.0\r\n\r\n`).
    pub fn with_greeting(mut self, greeting: impl Into<Vec<u8>>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }
}

#[async_trait]
impl Worker for BannerHunter {
    type Session = ReadBuffer;
    type Record = HuntRecord;

    fn open_session(&self) -> anyhow::Result<ReadBuffer> {
        Ok(ReadBuffer::new())
    }

    async fn run(
        &self,
        buffer: &mut ReadBuffer,
        target: &Target,
    ) -> anyhow::Result<Vec<HuntRecord>> {
        let addr = SocketAddr::new(resolve(target).await?[0], self.port);

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                trace!(%target, port = self.port, error = %e, "connection failed");
                return Ok(Vec::new());
            }
            Err(_elapsed) => {
                trace!(%target, port = self.port, "connection timed out");
                return Ok(Vec::new());
            }
        };

        if let Some(greeting) = &self.greeting {
            stream.write_all(greeting).await?;
        }

        let len = match timeout(self.read_timeout, stream.read(buffer.as_bytes_mut())).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                trace!(%target, port = self.port, error = %e, "read failed");
                0
            }
            Err(_elapsed) => 0,
        };

        let banner = String::from_utf8_lossy(buffer.as_bytes(len))
            .trim_end()
            .to_string();
        if banner.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![HuntRecord::Banner {
            port: self.port,
            banner,
        }])
    }
}
