//! WebSocket transport.
//!
//! Thin I/O layer: a spawned task bridges the tokio-tungstenite stream
//! to channel endpoints, and everything the session layer sees is a
//! [`SocketEvent`]. Connection failures surface as sanitized error
//! events followed by `Closed` — never as raw library errors — so the
//! reconnect path is identical for refused connections and mid-stream
//! drops.

use futures::{SinkExt as _, StreamExt as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::event::SocketEvent;

/// Transport errors. Only ever carried inside sanitized event
/// messages; the session layer never sees library error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection establishment failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The stream broke mid-session.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Handle to a live (or connecting) socket task.
///
/// Frames go out through `to_server`; everything inbound arrives on
/// `events`. Dropping or [`ConnectedSocket::stop`]ping the handle tears
/// the task down.
pub struct ConnectedSocket {
    /// Outbound text frames.
    pub to_server: mpsc::UnboundedSender<String>,
    /// Inbound socket events.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
    abort: tokio::task::AbortHandle,
}

impl ConnectedSocket {
    /// Kill the socket task.
    pub fn stop(&self) {
        self.abort.abort();
    }
}

/// Start a socket task against `endpoint`. Returns immediately; the
/// handshake outcome arrives as an `Opened` or `Error` event.
#[must_use]
pub fn open_socket(endpoint: String) -> ConnectedSocket {
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_socket(endpoint, to_server_rx, event_tx));
    ConnectedSocket { to_server: to_server_tx, events: event_rx, abort: handle.abort_handle() }
}

async fn run_socket(
    endpoint: String,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let (stream, _response) = match connect_async(endpoint.as_str()).await {
        Ok(ok) => ok,
        Err(err) => {
            let error = TransportError::Connection(err.to_string());
            let _ = events.send(SocketEvent::Error { message: error.to_string() });
            let _ = events.send(SocketEvent::Closed);
            return;
        },
    };

    tracing::debug!(%endpoint, "websocket open");
    let _ = events.send(SocketEvent::Opened);

    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        let error = TransportError::Stream(err.to_string());
                        let _ = events.send(SocketEvent::Error { message: error.to_string() });
                        break;
                    }
                },
                // Sender dropped: the client is done with this socket.
                None => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Frame(text));
                },
                // Control frames are handled by the library; binary
                // frames are not part of this protocol.
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {},
                Some(Err(err)) => {
                    let error = TransportError::Stream(err.to_string());
                    let _ = events.send(SocketEvent::Error { message: error.to_string() });
                    break;
                },
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    let _ = events.send(SocketEvent::Closed);
    tracing::debug!(%endpoint, "websocket closed");
}
