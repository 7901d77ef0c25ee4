//! Control-channel messages.
//!
//! The control channel carries small JSON objects in both directions. The
//! client only ever sends `next` and `close`; the only server frame that is
//! interpreted structurally is `register`, which carries the event-client
//! identity for the current connection.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message sent from the client to the server over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Flow-control acknowledgement: ready for more data on `stream`.
    Next {
        /// Stream name.
        stream: String,
    },
    /// The client is no longer interested in `stream`.
    Close {
        /// Stream name.
        stream: String,
    },
}

impl ClientMessage {
    /// Creates a `next` message.
    pub fn next(stream: impl Into<String>) -> Self {
        ClientMessage::Next {
            stream: stream.into(),
        }
    }

    /// Creates a `close` message.
    pub fn close(stream: impl Into<String>) -> Self {
        ClientMessage::Close {
            stream: stream.into(),
        }
    }

    /// Returns the stream this message refers to.
    pub fn stream(&self) -> &str {
        match self {
            ClientMessage::Next { stream } | ClientMessage::Close { stream } => stream,
        }
    }

    /// Encodes to JSON text.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message received from the server over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Registration: assigns the event-client identity for this connection.
    Register {
        /// Opaque event-client identity.
        client: String,
    },
    /// Any other frame. Not interpreted; kept for logging.
    Other {
        /// The `type` field, when present.
        kind: Option<String>,
        /// The raw decoded payload.
        raw: Value,
    },
}

impl ServerMessage {
    /// Decodes a control frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);

        if kind.as_deref() == Some("register") {
            let client = value
                .get("msg")
                .and_then(|msg| msg.get("client"))
                .and_then(Value::as_str)
                .filter(|client| !client.is_empty())
                .ok_or_else(|| {
                    ProtocolError::InvalidMessage("register frame without msg.client".into())
                })?;
            return Ok(ServerMessage::Register {
                client: client.to_string(),
            });
        }

        Ok(ServerMessage::Other { kind, raw: value })
    }

    /// Returns the event-client identity if this is a registration.
    pub fn event_client(&self) -> Option<&str> {
        match self {
            ServerMessage::Register { client } => Some(client),
            ServerMessage::Other { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_encode_with_type_tag() {
        assert_eq!(
            ClientMessage::next("alarms").encode().unwrap(),
            r#"{"type":"next","stream":"alarms"}"#
        );
        assert_eq!(
            ClientMessage::close("nodes").encode().unwrap(),
            r#"{"type":"close","stream":"nodes"}"#
        );
    }

    #[test]
    fn register_frame_carries_client() {
        let msg = ServerMessage::decode(r#"{"type":"register","msg":{"client":"ec-42"}}"#).unwrap();
        assert_eq!(msg.event_client(), Some("ec-42"));
    }

    #[test]
    fn register_without_client_is_rejected() {
        let err = ServerMessage::decode(r#"{"type":"register","msg":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn unknown_frames_are_opaque() {
        let msg = ServerMessage::decode(r#"{"type":"pong","seq":3}"#).unwrap();
        match msg {
            ServerMessage::Other { kind, raw } => {
                assert_eq!(kind.as_deref(), Some("pong"));
                assert_eq!(raw["seq"], 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_control_frame() {
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
