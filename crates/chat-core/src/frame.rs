//! JSON frames exchanged over the stream transport.
//!
//! Every frame is an object tagged by its `type` field. Inbound and outbound
//! shapes differ (the server adds `username`/`user_id` to typing frames, the
//! client sends raw text for chat messages), so each direction has its own
//! enum.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{Message, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ChatMessage {
        message: Message,
    },
    Typing {
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        username: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: MessageId,
        #[serde(default)]
        read_by: Option<UserId>,
    },
    Ping,
    Pong,
    UserJoin {
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        username: String,
    },
    UserLeave {
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        username: String,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::ChatMessage { .. } => "chat_message",
            ServerFrame::Typing { .. } => "typing",
            ServerFrame::ReadReceipt { .. } => "read_receipt",
            ServerFrame::Ping => "ping",
            ServerFrame::Pong => "pong",
            ServerFrame::UserJoin { .. } => "user_join",
            ServerFrame::UserLeave { .. } => "user_leave",
            ServerFrame::Error { .. } => "error",
        }
    }

    pub fn decode(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Decode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage { message: String },
    Typing { is_typing: bool },
    ReadReceipt { message_id: MessageId },
    Ping,
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::ChatMessage { .. } => "chat_message",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::ReadReceipt { .. } => "read_receipt",
            ClientFrame::Ping => "ping",
        }
    }

    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_inbound_typing_with_username() {
        let frame = ServerFrame::decode(
            r#"{"type":"typing","user_id":4,"username":"seller42","is_typing":true}"#,
        )
        .expect("typing frame");
        assert_eq!(
            frame,
            ServerFrame::Typing {
                user_id: Some(4),
                username: "seller42".into(),
                is_typing: true,
            }
        );
    }

    #[test]
    fn decodes_unit_frames() {
        assert_eq!(ServerFrame::decode(r#"{"type":"pong"}"#).unwrap(), ServerFrame::Pong);
        assert_eq!(ServerFrame::decode(r#"{"type":"ping"}"#).unwrap(), ServerFrame::Ping);
    }

    #[test]
    fn decodes_chat_message_envelope() {
        let text = r#"{"type":"chat_message","message":{"id":42,"content":"hi","sender_id":9,
            "sender_name":"Jo","timestamp":"2024-05-01T10:00:00Z","is_read":false}}"#;
        match ServerFrame::decode(text).expect("chat frame") {
            ServerFrame::ChatMessage { message } => {
                assert_eq!(message.id, 42);
                assert_eq!(message.content, "hi");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_or_untagged_frames_are_errors() {
        assert!(matches!(
            ServerFrame::decode(r#"{"type":"video_call"}"#),
            Err(ProtocolError::Decode(_))
        ));
        assert!(ServerFrame::decode(r#"{"message":"no tag"}"#).is_err());
        assert!(ServerFrame::decode("not json").is_err());
    }

    #[test]
    fn encodes_outbound_shapes() {
        let typing = ClientFrame::Typing { is_typing: false }.encode().unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&typing).unwrap(),
            serde_json::json!({"type": "typing", "is_typing": false})
        );
        let chat = ClientFrame::ChatMessage {
            message: "hello".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&chat).unwrap(),
            serde_json::json!({"type": "chat_message", "message": "hello"})
        );
        assert_eq!(ClientFrame::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }
}
