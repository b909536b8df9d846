use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, RoomConfig};

/// Events sent over the chat gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Snapshot pushed once, right after the connection opens
    Init {
        room: String,
        config: RoomConfig,
        messages: Vec<ChatMessage>,
    },

    /// A message was accepted (delivered to every connection)
    Message { message: ChatMessage },

    /// A `send` from this connection was rejected
    Error { message: String },

    /// The room announcement changed
    Announcement { announcement: String },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames sent FROM client TO server, before the `type` is inspected.
///
/// Unknown types are accepted here and ignored by the gateway so older servers
/// keep working with newer clients.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Body of a `send` frame, also accepted by `POST /messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendPayload {
    pub content: String,
    pub room: String,
    pub image_urls: Vec<String>,
}

/// A recognized client command.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Send(SendPayload),
}

impl ClientEnvelope {
    /// Interpret the envelope. Returns `None` for unknown types and for
    /// payloads that do not match the declared type.
    pub fn into_command(self) -> Option<ClientCommand> {
        match self.kind.as_str() {
            "send" => serde_json::from_value(self.data).ok().map(ClientCommand::Send),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_event_shape() {
        let event = ServerEvent::Error {
            message: "message too long".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "error", "data": {"message": "message too long"}}));
    }

    #[test]
    fn test_announcement_event_shape() {
        let event = ServerEvent::Announcement {
            announcement: "maintenance at noon".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "announcement");
        assert_eq!(value["data"]["announcement"], "maintenance at noon");
    }

    #[test]
    fn test_send_envelope_parses() {
        let raw = r#"{"type":"send","data":{"content":"hi","room":"lobby","image_urls":["/a.png"]}}"#;
        let envelope: ClientEnvelope = serde_json::from_str(raw).unwrap();
        let Some(ClientCommand::Send(payload)) = envelope.into_command() else {
            panic!("expected send command");
        };
        assert_eq!(payload.content, "hi");
        assert_eq!(payload.room, "lobby");
        assert_eq!(payload.image_urls, vec!["/a.png".to_string()]);
    }

    #[test]
    fn test_send_envelope_missing_fields_default() {
        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"type":"send","data":{"content":"x"}}"#).unwrap();
        let Some(ClientCommand::Send(payload)) = envelope.into_command() else {
            panic!("expected send command");
        };
        assert!(payload.room.is_empty());
        assert!(payload.image_urls.is_empty());
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"type":"typing","data":{}}"#).unwrap();
        assert!(envelope.into_command().is_none());

        let envelope: ClientEnvelope = serde_json::from_str(r#"{"type":"send"}"#).unwrap();
        assert!(envelope.into_command().is_none());

        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"type":"send","data":"oops"}"#).unwrap();
        assert!(envelope.into_command().is_none());
    }
}
