//! Real-time collections shared by every client: `messages` and `presence`.

pub mod firestore;
pub mod memory;
mod subscription;

use async_trait::async_trait;
use futures::future::join_all;

use crate::common::{
    ChatMessage, ClearReport, NewMessage, Participant, PresenceRecord, StatusUpdate,
};
use crate::error::ChannelError;

pub use firestore::{FirestoreChannel, FirestoreConfig};
pub use memory::MemoryHub;
pub use subscription::Subscription;

/// One delivery of the filtered message view, keyed by the conversation the
/// subscription was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub conversation_id: String,
    /// Newest first.
    pub messages: Vec<ChatMessage>,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Stores a new message with status `sent` and a server timestamp.
    /// Returns the assigned id.
    async fn create(&self, message: NewMessage) -> Result<String, ChannelError>;

    /// Moves the status field from `update.from` to `update.to`, touching no
    /// other field. Returns `false` without writing when the stored status is
    /// no longer `update.from`.
    async fn update_status(&self, update: &StatusUpdate) -> Result<bool, ChannelError>;

    async fn delete(&self, message_id: &str) -> Result<(), ChannelError>;

    /// One-shot read of a conversation, newest first.
    async fn query(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChannelError>;

    /// Snapshots of a conversation (`chatId == id`, `timestamp desc`) until
    /// the returned handle is dropped.
    fn subscribe_conversation(&self, conversation_id: &str) -> Subscription<MessageSnapshot>;
}

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Overwrites the participant's record and stamps `lastActive`.
    async fn upsert(&self, participant: &Participant) -> Result<(), ChannelError>;

    /// Snapshots of the whole presence collection.
    fn subscribe_presence(&self) -> Subscription<Vec<PresenceRecord>>;
}

/// Deletes every message of `conversation_id` as independent writes.
///
/// Failed deletes are not retried; their ids are reported as survivors.
pub async fn clear_conversation(
    channel: &dyn MessageChannel,
    conversation_id: &str,
) -> Result<ClearReport, ChannelError> {
    let messages = channel.query(conversation_id).await?;
    let results = join_all(messages.iter().map(|message| channel.delete(&message.id))).await;

    let mut report = ClearReport {
        conversation_id: conversation_id.to_string(),
        ..ClearReport::default()
    };
    for (message, result) in messages.iter().zip(results) {
        match result {
            Ok(()) => report.deleted += 1,
            Err(err) => {
                log::warn!("Failed to delete message {}: {err}", message.id);
                report.survivors.push(message.id.clone());
            }
        }
    }

    log::info!(
        "Cleared conversation {conversation_id}: {} deleted, {} survived",
        report.deleted,
        report.survivors.len()
    );
    Ok(report)
}
