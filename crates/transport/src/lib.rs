//! confsync-transport: request/response plumbing between client and server
//!
//! The client side talks through [`ConfigTransport`]; the server side exposes
//! its handlers as a [`ConfigService`]. [`TcpTransport`] and [`serve`] carry
//! the framed protocol over TCP, and [`LocalTransport`] connects the two in
//! process for tests.

pub mod listener;
pub mod local;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use confsync_core::{ApplyReply, ApplyRequest, FetchReply, FetchRequest};

pub use listener::{dispatch, serve};
pub use local::LocalTransport;
pub use tcp::TcpTransport;

/// A request never produced a reply.
///
/// A reply with a non-zero status is not a transport error; only these are
/// retried by the push loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} to {addr} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        addr: String,
        timeout: Duration,
    },

    #[error("connection to {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer answered with a protocol-level error frame
    #[error("server rejected request: {0}")]
    Remote(String),
}

impl TransportError {
    /// Classify a framing error raised while talking to `addr`
    pub fn from_wire(addr: &str, err: confsync_core::Error) -> Self {
        match err {
            confsync_core::Error::Stream(source) => Self::Io {
                addr: addr.to_string(),
                source,
            },
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// Client side of the Fetch/Apply exchange
#[async_trait]
pub trait ConfigTransport: Send + Sync {
    /// Request the full archive of a product subtree
    async fn fetch(&self, request: FetchRequest) -> Result<FetchReply, TransportError>;

    /// Push a changeset into a product subtree
    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, TransportError>;
}

#[async_trait]
impl<T: ConfigTransport + ?Sized> ConfigTransport for Arc<T> {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchReply, TransportError> {
        (**self).fetch(request).await
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, TransportError> {
        (**self).apply(request).await
    }
}

/// Server side of the Fetch/Apply exchange
///
/// Handlers never fail: every outcome is expressed as a reply status.
#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> FetchReply;

    async fn apply(&self, request: ApplyRequest) -> ApplyReply;
}
