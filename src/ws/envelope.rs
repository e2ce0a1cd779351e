//! Wire frames exchanged with the Max WebSocket API.
//!
//! Every frame is a JSON object of the shape
//! `{"ver": 11, "cmd": 0, "seq": 42, "opcode": 64, "payload": {...}}`.
//! The codec is stateless: sequence numbers are allocated by the request path.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WsError;
use crate::Result;
use crate::error::ServerError;

/// Protocol version stamped on every outgoing frame.
pub const PROTOCOL_VERSION: u8 = 11;

/// Semantic message kind carried by a frame.
///
/// Unknown opcodes decode fine; the associated constants only name the ones this
/// crate and its usual collaborators care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const PING: Self = Self(1);
    pub const SESSION_INIT: Self = Self(6);
    /// Token login, answered with the bulk state sync
    pub const LOGIN: Self = Self(19);
    pub const MSG_SEND: Self = Self(64);
    pub const MSG_DELETE: Self = Self(66);
    pub const MSG_EDIT: Self = Self(67);
    pub const PHOTO_UPLOAD: Self = Self(80);
    pub const VIDEO_UPLOAD: Self = Self(82);
    pub const FILE_UPLOAD: Self = Self(87);
    pub const FILE_DOWNLOAD: Self = Self(88);
    /// Server push: a new message arrived
    pub const NOTIF_MESSAGE: Self = Self(128);
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame direction/outcome marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cmd(pub u8);

impl Cmd {
    /// A client request, or a server-initiated push
    pub const REQUEST: Self = Self(0);
    pub const RESPONSE: Self = Self(1);
    pub const ERROR: Self = Self(3);

    /// Whether the frame answers an earlier request rather than initiating one.
    #[must_use]
    pub const fn is_reply(self) -> bool {
        self.0 != Self::REQUEST.0
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub ver: u8,
    pub cmd: Cmd,
    pub seq: u64,
    pub opcode: Opcode,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an outgoing request frame.
    #[must_use]
    pub fn request(seq: u64, opcode: Opcode, payload: Value) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            cmd: Cmd::REQUEST,
            seq,
            opcode,
            payload,
        }
    }

    /// Build a reply frame, mostly useful for mock servers.
    #[must_use]
    pub fn reply(seq: u64, opcode: Opcode, payload: Value) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            cmd: Cmd::RESPONSE,
            seq,
            opcode,
            payload,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text or binary frame.
    ///
    /// Fails with [`WsError::MessageParse`] on malformed JSON or when `cmd`, `seq` or
    /// `opcode` are missing.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| WsError::MessageParse(e).into())
    }

    /// Server error carried by this frame, if any.
    ///
    /// A payload with a non-empty `error` field is an error regardless of `cmd`; `null`,
    /// `false`, `0` and empty values mean success. A frame marked [`Cmd::ERROR`] without
    /// a readable error payload still yields a generic error.
    #[must_use]
    pub fn server_error(&self) -> Option<ServerError> {
        if let Some(error) = self.payload.get("error").filter(|e| is_set(e)) {
            return Some(
                serde_json::from_value::<ServerError>(self.payload.clone()).unwrap_or_else(
                    |_| ServerError {
                        error: error
                            .as_str()
                            .map_or_else(|| error.to_string(), str::to_owned),
                        ..ServerError::default()
                    },
                ),
            );
        }

        (self.cmd == Cmd::ERROR).then(|| ServerError {
            error: "unknown".to_owned(),
            ..ServerError::default()
        })
    }
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_u64() != Some(0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    #[test]
    fn request_should_encode_wire_shape() {
        let envelope = Envelope::request(3, Opcode::PING, json!({ "interactive": true }));
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "ver": 11,
                "cmd": 0,
                "seq": 3,
                "opcode": 1,
                "payload": { "interactive": true }
            })
        );
    }

    #[test]
    fn decode_should_default_optional_fields() {
        let envelope = Envelope::decode(br#"{"cmd":1,"seq":9,"opcode":19}"#).unwrap();

        assert_eq!(envelope.ver, 0);
        assert_eq!(envelope.cmd, Cmd::RESPONSE);
        assert_eq!(envelope.seq, 9);
        assert_eq!(envelope.opcode, Opcode::LOGIN);
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn decode_should_reject_missing_seq() {
        let error = Envelope::decode(br#"{"ver":11,"cmd":1,"opcode":1,"payload":{}}"#).unwrap_err();

        assert_eq!(error.kind(), Kind::Protocol);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::MessageParse(_))
        ));
    }

    #[test]
    fn decode_should_reject_garbage() {
        Envelope::decode(b"not json at all").unwrap_err();
    }

    #[test]
    fn server_error_should_read_error_payload() {
        let envelope = Envelope {
            cmd: Cmd::ERROR,
            ..Envelope::reply(
                4,
                Opcode::MSG_SEND,
                json!({
                    "error": "chat.not.found",
                    "message": "Chat not found",
                    "localizedMessage": "Чат не найден",
                    "title": "Error"
                }),
            )
        };

        let error = envelope.server_error().unwrap();
        assert_eq!(error.error, "chat.not.found");
        assert_eq!(error.message.as_deref(), Some("Chat not found"));
        assert_eq!(error.title.as_deref(), Some("Error"));
    }

    #[test]
    fn server_error_should_tolerate_non_string_error() {
        let envelope = Envelope::reply(4, Opcode::MSG_SEND, json!({ "error": 500 }));

        assert_eq!(envelope.server_error().unwrap().error, "500");
    }

    #[test]
    fn successful_reply_has_no_server_error() {
        let envelope = Envelope::reply(4, Opcode::MSG_SEND, json!({ "message": { "id": 1 } }));

        assert!(envelope.server_error().is_none());
        assert!(envelope.cmd.is_reply());
        assert!(!Cmd::REQUEST.is_reply());
    }

    #[test]
    fn null_or_empty_error_field_means_success() {
        for error in [json!(null), json!(""), json!(false), json!(0)] {
            let envelope = Envelope::reply(
                4,
                Opcode::LOGIN,
                json!({ "error": error, "message": { "id": 1 } }),
            );

            assert!(envelope.server_error().is_none(), "{error} treated as an error");
        }
    }
}
