//! Async driver loop.
//!
//! Bridges the sans-IO session to real I/O: executes wire commands,
//! feeds socket events back in, and ticks timers. One task per client;
//! `tokio::select!` over the socket, the wake signal, and the tick
//! clock.

use std::time::Duration;

use driftwire_core::Environment;

use crate::client::{Client, WireCommand};
use crate::event::SocketEvent;
use crate::transport::{ConnectedSocket, open_socket};

/// Timer granularity. Reconnect and login-retry deadlines fire on the
/// first tick at or after their instant.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a running driver task.
pub struct RuntimeHandle {
    abort: tokio::task::AbortHandle,
}

impl RuntimeHandle {
    /// Kill the driver (and its socket, if any).
    pub fn stop(&self) {
        self.abort.abort();
    }
}

/// Spawn the driver for `client`. Honors `auto_connect`.
pub fn start<E: Environment>(client: Client<E>) -> RuntimeHandle {
    let handle = tokio::spawn(run(client));
    RuntimeHandle { abort: handle.abort_handle() }
}

async fn run<E: Environment>(client: Client<E>) {
    let config = client.config_snapshot();
    if config.auto_connect {
        client.connect();
    }

    let wake = client.wake();
    let mut socket: Option<ConnectedSocket> = None;

    loop {
        for command in client.drive() {
            match command {
                WireCommand::Open => {
                    if socket.is_none() {
                        socket = Some(open_socket(config.endpoint.clone()));
                    }
                },
                WireCommand::Close => {
                    if let Some(live) = socket.take() {
                        live.stop();
                        // The aborted task cannot deliver its own close
                        // event any more.
                        client.handle_socket_event(SocketEvent::Closed);
                    }
                },
                WireCommand::Send(frame) => match &socket {
                    Some(live) => {
                        let _ = live.to_server.send(frame);
                    },
                    None => tracing::warn!("dropping frame: no socket"),
                },
            }
        }

        tokio::select! {
            event = next_event(&mut socket) => match event {
                Some(event) => {
                    let closed = matches!(event, SocketEvent::Closed);
                    client.handle_socket_event(event);
                    if closed {
                        socket = None;
                    }
                },
                None => {
                    if socket.take().is_some() {
                        client.handle_socket_event(SocketEvent::Closed);
                    }
                },
            },
            () = wake.notified() => {},
            () = client.env().sleep(TICK_INTERVAL) => client.tick(),
        }
    }
}

async fn next_event(socket: &mut Option<ConnectedSocket>) -> Option<SocketEvent> {
    match socket {
        Some(live) => live.events.recv().await,
        None => std::future::pending().await,
    }
}
