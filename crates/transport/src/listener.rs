//! TCP accept loop for the config server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use confsync_core::{Message, ProtocolReader, ProtocolWriter};

use crate::ConfigService;

/// Route one request message to the matching service handler
pub async fn dispatch<S: ConfigService + ?Sized>(service: &S, message: Message) -> Message {
    match message {
        Message::FetchReq(request) => Message::FetchResp(service.fetch(request).await),
        Message::ApplyReq(request) => Message::ApplyResp(service.apply(request).await),
        other => Message::Error(format!("unexpected {}", other.name())),
    }
}

/// Accept connections until `cancel` fires, one task per connection.
///
/// After cancellation no new connections are accepted and idle connections
/// are closed; requests already being handled run to completion.
///
/// # Errors
/// Returns an error if the listener's local address cannot be read.
pub async fn serve<S>(
    listener: TcpListener,
    service: Arc<S>,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    S: ConfigService + 'static,
{
    info!("listening on {}", listener.local_addr()?);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("connection from {peer}");
                    let service = Arc::clone(&service);
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, service.as_ref(), &cancel).await {
                            warn!("connection from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    if !connections.is_empty() {
        info!("waiting for {} open connections", connections.len());
    }
    while connections.join_next().await.is_some() {}
    info!("listener stopped");
    Ok(())
}

async fn handle_connection<S: ConfigService + ?Sized>(
    stream: TcpStream,
    peer: SocketAddr,
    service: &S,
    cancel: &CancellationToken,
) -> confsync_core::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = ProtocolReader::new(BufReader::new(read_half));
    let mut writer = ProtocolWriter::new(write_half);

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = reader.next_message() => next,
        };

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("{peer} closed the connection");
                return Ok(());
            }
            Err(confsync_core::Error::Protocol(text)) => {
                writer.send_error(&text).await?;
                return Err(confsync_core::Error::Protocol(text));
            }
            Err(e) => return Err(e),
        };

        debug!("{} from {peer}", message.name());
        let reply = dispatch(service, message).await;
        writer.send(&reply).await?;
    }
}
