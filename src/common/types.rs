use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A local user, identified by their contact id (phone number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub display_name: String,
    pub contact_id: String,
}

impl Participant {
    pub fn new(display_name: impl Into<String>, contact_id: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            contact_id: contact_id.into(),
        }
    }
}

/// "I am here" heartbeat published by each participant, one per contact id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub contact_id: String,
    pub display_name: String,
    /// Server-assigned; `None` while the server timestamp is still pending.
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Delivery state of a message. Ordered: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Status only moves forward, one step at a time.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Sent, MessageStatus::Delivered)
                | (MessageStatus::Delivered, MessageStatus::Read)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored chat message as delivered by the message channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_contact_id: String,
    pub sender_display_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

/// A message about to be created; id and timestamp are assigned by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_contact_id: String,
    pub sender_display_name: String,
    pub content: String,
}

/// Compare-and-set write produced by a status sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message_id: String,
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// Outcome of deleting every message of a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub conversation_id: String,
    pub deleted: usize,
    /// Messages whose delete failed; they survive the clear.
    pub survivors: Vec<String>,
}

impl ClearReport {
    pub fn is_complete(&self) -> bool {
        self.survivors.is_empty()
    }
}
