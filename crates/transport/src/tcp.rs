//! TCP client transport
//!
//! Opens one connection per request. Connecting is bounded by its own
//! timeout; the send-and-wait-for-reply exchange by a per-operation one.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

use confsync_core::{
    ApplyReply, ApplyRequest, FetchReply, FetchRequest, Message, ProtocolReader, ProtocolWriter,
};

use crate::{ConfigTransport, TransportError};

/// Connects to a config server at `host:port`
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    fetch_timeout: Duration,
    apply_timeout: Duration,
}

impl TcpTransport {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            fetch_timeout: Self::DEFAULT_FETCH_TIMEOUT,
            apply_timeout: Self::DEFAULT_APPLY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        // Small request frames should not wait on Nagle
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Send one request and wait for its reply
    async fn round_trip(
        &self,
        operation: &'static str,
        request: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let stream = self.connect().await?;
        debug!("sending {} to {}", request.name(), self.addr);

        let exchange = async move {
            let (read_half, write_half) = stream.into_split();
            ProtocolWriter::new(write_half).send(&request).await?;
            ProtocolReader::new(BufReader::new(read_half))
                .read_message()
                .await
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(TransportError::Timeout {
                operation,
                addr: self.addr.clone(),
                timeout,
            }),
            Ok(Err(e)) => Err(TransportError::from_wire(&self.addr, e)),
            Ok(Ok(Message::Error(text))) => Err(TransportError::Remote(text)),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

#[async_trait]
impl ConfigTransport for TcpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchReply, TransportError> {
        match self
            .round_trip("fetch", Message::FetchReq(request), self.fetch_timeout)
            .await?
        {
            Message::FetchResp(reply) => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "expected fetch response, got {}",
                other.name()
            ))),
        }
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, TransportError> {
        match self
            .round_trip("apply", Message::ApplyReq(request), self.apply_timeout)
            .await?
        {
            Message::ApplyResp(reply) => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "expected apply response, got {}",
                other.name()
            ))),
        }
    }
}
