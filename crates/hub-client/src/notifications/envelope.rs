//! Push channel wire format.

use serde::{Deserialize, Serialize};

use super::model::Notification;
use crate::credentials::UserId;
use crate::error::{ClientError, Result};

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushEnvelope {
    Notification { payload: Notification },
    /// Handshake accepted.
    Ack,
    Error { message: String },
    Ping,
}

impl PushEnvelope {
    /// Decode a text frame. Anything that is not a known envelope is malformed.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ClientError::MalformedPush(e.to_string()))
    }
}

/// Client to server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { user_id: UserId, token: String },
}

impl ClientMessage {
    pub fn authenticate(user_id: UserId, token: impl Into<String>) -> Self {
        Self::Authenticate {
            user_id,
            token: token.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_kinds() {
        assert_eq!(PushEnvelope::decode(r#"{"kind":"ack"}"#).unwrap(), PushEnvelope::Ack);
        assert_eq!(PushEnvelope::decode(r#"{"kind":"ping"}"#).unwrap(), PushEnvelope::Ping);

        let text = serde_json::json!({
            "kind": "notification",
            "payload": {"id": 1, "message": "hi", "created_at": "2024-01-01 08:00"},
        })
        .to_string();
        let envelope = PushEnvelope::decode(&text).unwrap();
        assert!(matches!(envelope, PushEnvelope::Notification { payload } if payload.id == 1));
    }

    #[test]
    fn test_decode_rejects_raw_and_unknown() {
        let raw = r#"{"id":1,"message":"hi","created_at":"2024-01-01 08:00"}"#;
        assert!(matches!(
            PushEnvelope::decode(raw),
            Err(ClientError::MalformedPush(_))
        ));
        assert!(PushEnvelope::decode(r#"{"kind":"bogus"}"#).is_err());
        assert!(PushEnvelope::decode("not json").is_err());
    }

    #[test]
    fn test_handshake_encoding() {
        let text = ClientMessage::authenticate(42, "tok").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "authenticate");
        assert_eq!(value["user_id"], 42);
        assert_eq!(value["token"], "tok");
    }
}
