//! Local in-process transport for testing
//!
//! `LocalTransport` hands requests straight to a [`ConfigService`] without a
//! socket. Every request and reply is still encoded and decoded as a wire
//! frame, so anything that cannot cross the network fails here too.

use std::sync::Arc;

use async_trait::async_trait;

use confsync_core::protocol::{decode_message, encode_message};
use confsync_core::{ApplyReply, ApplyRequest, FetchReply, FetchRequest, Message};

use crate::listener::dispatch;
use crate::{ConfigService, ConfigTransport, TransportError};

const LOCAL_ADDR: &str = "local";

/// Local transport for testing (no socket, calls the service directly)
pub struct LocalTransport<S: ?Sized> {
    service: Arc<S>,
}

impl<S: ConfigService + ?Sized> LocalTransport<S> {
    /// Create a new local transport serving from `service`
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    /// The service behind this transport
    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    async fn round_trip(&self, request: Message) -> Result<Message, TransportError> {
        let wire = |err| TransportError::from_wire(LOCAL_ADDR, err);

        let request = decode_message(&encode_message(&request).map_err(wire)?).map_err(wire)?;
        let reply = dispatch(self.service.as_ref(), request).await;
        match decode_message(&encode_message(&reply).map_err(wire)?).map_err(wire)? {
            Message::Error(text) => Err(TransportError::Remote(text)),
            reply => Ok(reply),
        }
    }
}

#[async_trait]
impl<S: ConfigService + ?Sized> ConfigTransport for LocalTransport<S> {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchReply, TransportError> {
        match self.round_trip(Message::FetchReq(request)).await? {
            Message::FetchResp(reply) => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "expected fetch response, got {}",
                other.name()
            ))),
        }
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, TransportError> {
        match self.round_trip(Message::ApplyReq(request)).await? {
            Message::ApplyResp(reply) => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "expected apply response, got {}",
                other.name()
            ))),
        }
    }
}
