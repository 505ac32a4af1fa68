//! Shared scaffolding: a client on a mock clock, driven with scripted
//! server frames. No network anywhere.

#![allow(dead_code)]

use std::sync::Arc;

use driftwire_client::{Client, ClientConfig, MemoryKeyStorage, Notice, SocketEvent, WireCommand};
use driftwire_core::env::test_utils::MockEnv;
use parking_lot::Mutex;
use serde_json::Value;

pub struct Harness {
    pub client: Client<MockEnv>,
    pub env: MockEnv,
    pub storage: MemoryKeyStorage,
    pub notices: Arc<Mutex<Vec<Notice>>>,
}

pub fn harness() -> Harness {
    let env = MockEnv::new();
    let storage = MemoryKeyStorage::new();
    let config = ClientConfig::new("ws://localhost:3000/websocket");
    let client = Client::with_env(env.clone(), config, Arc::new(storage.clone()))
        .expect("config is valid");

    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notices);
    client.on_notice(move |notice| sink.lock().push(notice.clone()));

    Harness { client, env, storage, notices }
}

impl Harness {
    /// Feed a raw server frame.
    pub fn frame(&self, text: &str) {
        self.client.handle_socket_event(SocketEvent::Frame(text.to_string()));
    }

    /// Open the socket and complete the handshake with `session`.
    /// Returns the drained wire commands from the whole exchange.
    pub fn establish(&self, session: &str) -> Vec<WireCommand> {
        self.client.connect();
        self.client.handle_socket_event(SocketEvent::Opened);
        self.frame(&format!(r#"{{"msg":"connected","session":"{session}"}}"#));
        self.client.drive()
    }

    /// Drain wire commands and keep only the sent frames, parsed.
    pub fn sent(&self) -> Vec<Value> {
        sent_frames(&self.client.drive())
    }
}

/// Parsed `Send` frames from a command batch, in order.
pub fn sent_frames(commands: &[WireCommand]) -> Vec<Value> {
    commands
        .iter()
        .filter_map(|command| match command {
            WireCommand::Send(text) => {
                Some(serde_json::from_str(text).expect("client frames are JSON"))
            },
            _ => None,
        })
        .collect()
}

/// The frames in `frames` whose `msg` equals `tag`.
pub fn with_tag<'a>(frames: &'a [Value], tag: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["msg"] == tag).collect()
}
