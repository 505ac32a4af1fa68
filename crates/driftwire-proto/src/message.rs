//! Typed DDP messages.
//!
//! Client-to-server frames serialize through [`ClientMessage`];
//! server-to-client frames parse through [`ServerMessage::parse`],
//! which dispatches explicitly on the `msg` tag. Unknown tags are kept
//! as [`ServerMessage::Unknown`] so the session layer can surface them
//! as error events instead of dropping them on the floor, and frames
//! with no `msg` at all (the server's greeting line, for one) parse to
//! `None` and are ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::PROTOCOL_VERSION;
use crate::errors::ProtocolError;

/// The `msg` tags this client understands.
const KNOWN_TAGS: &[&str] = &[
    "connected", "failed", "ping", "ready", "nosub", "added", "changed", "removed", "result",
    "updated", "error",
];

/// A frame the client puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Session establishment, sent once per socket open.
    Connect {
        /// Previously remembered session id, for resume.
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        /// Protocol version we speak.
        version: String,
        /// Versions we would accept.
        support: Vec<String>,
    },

    /// Keepalive response to a server `ping`.
    Pong {
        /// Echo of the ping id, if the server sent one.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Start a publication subscription.
    Sub {
        /// Wire id of the subscription.
        id: String,
        /// Publication name.
        name: String,
        /// EJSON parameters.
        params: Vec<Value>,
    },

    /// Stop a publication subscription.
    Unsub {
        /// Wire id given on the original `sub`.
        id: String,
    },

    /// Remote method invocation.
    Method {
        /// Correlation id for the `result` frame.
        id: String,
        /// Method name.
        method: String,
        /// EJSON arguments.
        params: Vec<Value>,
    },
}

impl ClientMessage {
    /// Build a `connect` frame for protocol version 1.
    #[must_use]
    pub fn connect(session: Option<String>) -> Self {
        Self::Connect {
            session,
            version: PROTOCOL_VERSION.to_string(),
            support: vec![PROTOCOL_VERSION.to_string()],
        }
    }

    /// Serialize to frame text.
    #[must_use]
    pub fn stringify(&self) -> String {
        #[allow(clippy::expect_used)]
        // INVARIANT: ClientMessage is composed of strings and JSON values;
        // serde_json cannot fail on it (no non-string map keys).
        serde_json::to_string(self).expect("invariant: ClientMessage serializes to JSON")
    }
}

/// The `changed` frame.
///
/// Carries the vent side-channel fields as first-class members:
/// a frame with `__vent == "1"` is an event delivery, not a document
/// update, and `collection` may then be absent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangedMessage {
    /// Collection the document lives in. Absent on vent frames.
    #[serde(default)]
    pub collection: Option<String>,
    /// Document id (or vent subscription id).
    pub id: String,
    /// Replaced field values.
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
    /// Field names removed from the document.
    #[serde(default)]
    pub cleared: Option<Vec<String>>,
    /// Side-channel sentinel; `"1"` marks a vent delivery.
    #[serde(default, rename = "__vent")]
    pub vent: Option<String>,
    /// Side-channel event payload.
    #[serde(default, rename = "e")]
    pub event: Option<Value>,
}

impl ChangedMessage {
    /// Whether this frame is a vent side-channel delivery.
    #[must_use]
    pub fn is_vent(&self) -> bool {
        self.vent.as_deref() == Some("1")
    }
}

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Session established; `session` is the server's session id.
    Connected {
        /// Session id to remember for resume.
        session: String,
    },

    /// Version negotiation failed.
    Failed {
        /// Version the server would have accepted.
        #[serde(default)]
        version: Option<String>,
    },

    /// Keepalive probe; must be answered with `pong`.
    Ping {
        /// Optional id to echo back.
        #[serde(default)]
        id: Option<String>,
    },

    /// Listed subscriptions have delivered their initial data set.
    Ready {
        /// Wire ids of the now-ready subscriptions.
        subs: Vec<String>,
    },

    /// A subscription ended, normally or with an error.
    Nosub {
        /// Wire id of the subscription.
        id: String,
        /// Error, when the server rejected or killed the subscription.
        #[serde(default)]
        error: Option<Value>,
    },

    /// Document added to a collection.
    Added {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
        /// Document fields, `_id` excluded.
        #[serde(default)]
        fields: Option<Map<String, Value>>,
    },

    /// Document changed (or vent event, see [`ChangedMessage`]).
    Changed(ChangedMessage),

    /// Document removed from a collection.
    Removed {
        /// Collection name.
        collection: String,
        /// Document id.
        id: String,
    },

    /// Method call result.
    Result {
        /// Correlation id from the `method` frame.
        id: String,
        /// Return value on success.
        #[serde(default)]
        result: Option<Value>,
        /// Error value on failure.
        #[serde(default)]
        error: Option<Value>,
    },

    /// Listed methods' writes have been reflected in data frames.
    Updated {
        /// Ids of methods whose write barrier cleared.
        methods: Vec<String>,
    },

    /// Server-reported protocol error.
    Error {
        /// Human-readable reason.
        #[serde(default)]
        reason: Option<String>,
        /// Structured error value.
        #[serde(default)]
        error: Option<Value>,
        /// The client frame that triggered the error, if any.
        #[serde(default, rename = "offendingMessage")]
        offending_message: Option<Value>,
    },

    /// A frame with a `msg` tag this client does not understand.
    #[serde(skip)]
    Unknown {
        /// The unrecognized tag.
        msg: String,
        /// The whole frame, for diagnostics.
        raw: Value,
    },
}

impl ServerMessage {
    /// Parse a text frame.
    ///
    /// Returns `Ok(None)` for valid JSON without a `msg` tag (ignored
    /// per protocol), `Unknown` for unrecognized tags, and an error for
    /// non-JSON text or a known tag with a bad payload — both of which
    /// the session layer drops without killing the socket.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let Some(tag) = value.get("msg").and_then(Value::as_str) else {
            return Ok(None);
        };

        if !KNOWN_TAGS.contains(&tag) {
            return Ok(Some(Self::Unknown { msg: tag.to_string(), raw: value }));
        }

        let tag = tag.to_string();
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ProtocolError::InvalidPayload { msg: tag, reason: e.to_string() })
    }

    /// The frame's `msg` tag, for logging.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
            Self::Ping { .. } => "ping",
            Self::Ready { .. } => "ready",
            Self::Nosub { .. } => "nosub",
            Self::Added { .. } => "added",
            Self::Changed(_) => "changed",
            Self::Removed { .. } => "removed",
            Self::Result { .. } => "result",
            Self::Updated { .. } => "updated",
            Self::Error { .. } => "error",
            Self::Unknown { msg, .. } => msg,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn connect_frame_omits_absent_session() {
        let text = ClientMessage::connect(None).stringify();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["msg"], "connect");
        assert_eq!(value["version"], "1");
        assert_eq!(value["support"], json!(["1"]));
        assert!(value.get("session").is_none());
    }

    #[test]
    fn connect_frame_carries_remembered_session() {
        let text = ClientMessage::connect(Some("S1".to_string())).stringify();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["session"], "S1");
    }

    #[test]
    fn sub_frame_shape() {
        let msg = ClientMessage::Sub {
            id: "r1".to_string(),
            name: "things".to_string(),
            params: vec![json!(7)],
        };
        let value: Value = serde_json::from_str(&msg.stringify()).unwrap();
        assert_eq!(value, json!({"msg": "sub", "id": "r1", "name": "things", "params": [7]}));
    }

    #[test]
    fn parses_connected() {
        let msg = ServerMessage::parse(r#"{"msg":"connected","session":"S1"}"#).unwrap().unwrap();
        assert_eq!(msg, ServerMessage::Connected { session: "S1".to_string() });
    }

    #[test]
    fn parses_ready_with_subs() {
        let msg = ServerMessage::parse(r#"{"msg":"ready","subs":["r1","r2"]}"#).unwrap().unwrap();
        assert_eq!(msg, ServerMessage::Ready { subs: vec!["r1".to_string(), "r2".to_string()] });
    }

    #[test]
    fn parses_changed_with_cleared() {
        let msg = ServerMessage::parse(
            r#"{"msg":"changed","collection":"items","id":"x","fields":{"a":1},"cleared":["b"]}"#,
        )
        .unwrap()
        .unwrap();
        let ServerMessage::Changed(changed) = msg else {
            panic!("expected changed");
        };
        assert_eq!(changed.collection.as_deref(), Some("items"));
        assert_eq!(changed.cleared, Some(vec!["b".to_string()]));
        assert!(!changed.is_vent());
    }

    #[test]
    fn parses_vent_changed_without_collection() {
        let msg = ServerMessage::parse(r#"{"msg":"changed","id":"v1","__vent":"1","e":{"k":2}}"#)
            .unwrap()
            .unwrap();
        let ServerMessage::Changed(changed) = msg else {
            panic!("expected changed");
        };
        assert!(changed.is_vent());
        assert_eq!(changed.event, Some(json!({"k": 2})));
    }

    #[test]
    fn greeting_without_msg_is_ignored() {
        assert_eq!(ServerMessage::parse(r#"{"server_id":"0"}"#).unwrap(), None);
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let msg = ServerMessage::parse(r#"{"msg":"wat","x":1}"#).unwrap().unwrap();
        assert_eq!(msg.tag(), "wat");
        assert!(matches!(msg, ServerMessage::Unknown { .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            ServerMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn known_tag_with_bad_payload_is_invalid() {
        assert!(matches!(
            ServerMessage::parse(r#"{"msg":"ready","subs":"nope"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn result_keeps_null_and_absent_distinct_enough() {
        let msg =
            ServerMessage::parse(r#"{"msg":"result","id":"m1","result":2}"#).unwrap().unwrap();
        assert_eq!(
            msg,
            ServerMessage::Result {
                id: "m1".to_string(),
                result: Some(json!(2)),
                error: None,
            }
        );
    }

    fn arb_params() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                "[a-z]{0,12}".prop_map(Value::from),
                Just(Value::Null),
            ],
            0..4,
        )
    }

    proptest! {
        #[test]
        fn method_frames_round_trip_as_json(
            id in "[A-Za-z0-9]{1,17}",
            method in "[a-z/.]{1,20}",
            params in arb_params(),
        ) {
            let msg = ClientMessage::Method {
                id: id.clone(),
                method: method.clone(),
                params: params.clone(),
            };
            let value: Value = serde_json::from_str(&msg.stringify()).unwrap();
            prop_assert_eq!(&value["msg"], "method");
            prop_assert_eq!(value["id"].as_str().unwrap(), id.as_str());
            prop_assert_eq!(value["method"].as_str().unwrap(), method.as_str());
            prop_assert_eq!(value["params"].as_array().unwrap(), &params);
        }
    }
}
