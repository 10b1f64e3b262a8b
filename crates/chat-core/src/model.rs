use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type MessageId = i64;
pub type UserId = i64;

/// A chat message as delivered by the server, over either transport.
///
/// Messages are immutable once received; the only field the client ever
/// flips is `is_read`, in response to a read receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub is_read: bool,
    /// Present on history pages; stream frames leave it to the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_mine: Option<bool>,
    #[serde(default)]
    pub has_attachment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender_id: UserId,
        content: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            conversation_id: None,
            sender_id,
            sender_name: None,
            sender_avatar: None,
            content: content.into(),
            timestamp,
            is_read: false,
            is_mine: None,
            has_attachment: false,
            attachment_url: None,
        }
    }

    /// Server-supplied ownership wins; otherwise compare against the local user.
    pub fn is_mine(&self, current_user: UserId) -> bool {
        self.is_mine.unwrap_or(self.sender_id == current_user)
    }

    pub fn display_name(&self) -> &str {
        self.sender_name.as_deref().unwrap_or("unknown")
    }
}

/// One page of history as returned by the list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
}
