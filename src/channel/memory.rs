//! In-process stand-in for the hosted collections. Every clone of a
//! [`MemoryHub`] sees the same documents, so several clients in one process
//! can talk to each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::{MessageChannel, MessageSnapshot, PresenceChannel, Subscription};
use crate::common::{
    ChatMessage, MessageStatus, NewMessage, Participant, PresenceRecord, StatusUpdate,
};
use crate::error::ChannelError;

const CHANGE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Messages,
    Presence,
}

#[derive(Default)]
struct HubData {
    messages: HashMap<String, ChatMessage>,
    presence: HashMap<String, PresenceRecord>,
    last_stamp: Option<DateTime<Utc>>,
    failing_deletes: HashSet<String>,
}

impl HubData {
    /// Server clock; strictly increasing so ordering by timestamp is total.
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn conversation(&self, conversation_id: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .messages
            .values()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages
    }

    fn presence(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.presence.values().cloned().collect();
        records.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        records
    }
}

struct Inner {
    data: Mutex<HubData>,
    changes: broadcast::Sender<Collection>,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Inner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(HubData::default()),
                changes,
            }),
        }
    }

    /// Every stored message, across all conversations.
    pub fn all_messages(&self) -> Vec<ChatMessage> {
        self.inner.data.lock().messages.values().cloned().collect()
    }

    /// Backdates a presence record, as if the client stopped heartbeating.
    #[cfg(test)]
    pub(crate) fn set_last_active(&self, contact_id: &str, at: DateTime<Utc>) {
        let changed = {
            let mut data = self.inner.data.lock();
            match data.presence.get_mut(contact_id) {
                Some(record) => {
                    record.last_active_at = Some(at);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify(Collection::Presence);
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_deletes_for(&self, message_id: &str) {
        self.inner
            .data
            .lock()
            .failing_deletes
            .insert(message_id.to_string());
    }

    fn notify(&self, collection: Collection) {
        // No receivers simply means nobody is subscribed yet.
        let _ = self.inner.changes.send(collection);
    }

    /// Pushes `read()` to the subscriber now and after every change of
    /// `collection`, skipping deliveries identical to the previous one.
    fn watch<T, R>(&self, collection: Collection, read: R) -> Subscription<T>
    where
        T: Clone + PartialEq + Send + 'static,
        R: Fn(&HubData) -> T + Send + 'static,
    {
        let hub = self.clone();
        let mut changes = self.inner.changes.subscribe();

        Subscription::spawn(move |sender| async move {
            let mut last: Option<T> = None;
            loop {
                let current = read(&hub.inner.data.lock());
                if last.as_ref() != Some(&current) {
                    last = Some(current.clone());
                    if sender.send(Ok(current)).await.is_err() {
                        return;
                    }
                }

                loop {
                    match changes.recv().await {
                        Ok(changed) if changed == collection => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::debug!("Subscriber lagged by {skipped} change(s); resyncing");
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        })
    }
}

#[async_trait]
impl MessageChannel for MemoryHub {
    async fn create(&self, message: NewMessage) -> Result<String, ChannelError> {
        let id = Uuid::new_v4().simple().to_string();
        {
            let mut data = self.inner.data.lock();
            let created_at = data.stamp();
            data.messages.insert(
                id.clone(),
                ChatMessage {
                    id: id.clone(),
                    conversation_id: message.conversation_id,
                    sender_contact_id: message.sender_contact_id,
                    sender_display_name: message.sender_display_name,
                    content: message.content,
                    created_at,
                    status: MessageStatus::Sent,
                },
            );
        }
        self.notify(Collection::Messages);
        Ok(id)
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<bool, ChannelError> {
        {
            let mut data = self.inner.data.lock();
            let message = data
                .messages
                .get_mut(&update.message_id)
                .ok_or_else(|| ChannelError::NotFound(update.message_id.clone()))?;
            if message.status != update.from {
                log::debug!(
                    "Message {} is {}, not {}; skipping write",
                    update.message_id,
                    message.status,
                    update.from
                );
                return Ok(false);
            }
            message.status = update.to;
        }
        self.notify(Collection::Messages);
        Ok(true)
    }

    async fn delete(&self, message_id: &str) -> Result<(), ChannelError> {
        {
            let mut data = self.inner.data.lock();
            if data.failing_deletes.contains(message_id) {
                return Err(ChannelError::Rejected {
                    status: 503,
                    message: format!("delete of {message_id} unavailable"),
                });
            }
            data.messages.remove(message_id);
        }
        self.notify(Collection::Messages);
        Ok(())
    }

    async fn query(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChannelError> {
        Ok(self.inner.data.lock().conversation(conversation_id))
    }

    fn subscribe_conversation(&self, conversation_id: &str) -> Subscription<MessageSnapshot> {
        let conversation_id = conversation_id.to_string();
        self.watch(Collection::Messages, move |data| MessageSnapshot {
            conversation_id: conversation_id.clone(),
            messages: data.conversation(&conversation_id),
        })
    }
}

#[async_trait]
impl PresenceChannel for MemoryHub {
    async fn upsert(&self, participant: &Participant) -> Result<(), ChannelError> {
        {
            let mut data = self.inner.data.lock();
            let last_active_at = Some(data.stamp());
            data.presence.insert(
                participant.contact_id.clone(),
                PresenceRecord {
                    contact_id: participant.contact_id.clone(),
                    display_name: participant.display_name.clone(),
                    last_active_at,
                },
            );
        }
        self.notify(Collection::Presence);
        Ok(())
    }

    fn subscribe_presence(&self) -> Subscription<Vec<PresenceRecord>> {
        self.watch(Collection::Presence, HubData::presence)
    }
}
