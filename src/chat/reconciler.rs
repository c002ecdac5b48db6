//! Pure conversation logic: canonical ids, status derivation and the
//! compare-and-set sweeps that advance `sent -> delivered -> read`.
//!
//! Nothing here performs I/O. The session driver turns the returned
//! [`StatusUpdate`]s into independent writes against the message channel.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::common::{ChatMessage, MessageStatus, PresenceRecord, StatusUpdate};

/// Joins the two sorted contact ids. Contact ids may not contain it.
pub const CONVERSATION_ID_DELIMITER: char = '_';

/// Canonical, order-independent id of the conversation between `a` and `b`.
pub fn conversation_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}{CONVERSATION_ID_DELIMITER}{second}")
}

/// Tick marks shown to `viewer`: only the sender sees a status.
pub fn derive_status(message: &ChatMessage, viewer: &str) -> Option<MessageStatus> {
    if message.sender_contact_id != viewer {
        return None;
    }
    Some(message.status)
}

/// Whether a presence record counts as online at `now`.
///
/// A record whose server timestamp is still pending is online; so is one
/// stamped slightly in the future (clock skew).
pub fn is_fresh(record: &PresenceRecord, now: DateTime<Utc>, ttl: Duration) -> bool {
    match record.last_active_at {
        None => true,
        Some(last_active) => now.signed_duration_since(last_active) <= ttl,
    }
}

/// Participants currently online, sorted by display name.
pub fn online_participants(
    records: &[PresenceRecord],
    now: DateTime<Utc>,
    ttl: Duration,
) -> Vec<PresenceRecord> {
    let mut online: Vec<PresenceRecord> = records
        .iter()
        .filter(|record| is_fresh(record, now, ttl))
        .cloned()
        .collect();
    online.sort_by(|a, b| {
        a.display_name
            .cmp(&b.display_name)
            .then_with(|| a.contact_id.cmp(&b.contact_id))
    });
    online
}

/// Sender-side sweep: once `partner` is online, every `sent` message `me`
/// wrote in `conversation_id` becomes `delivered`.
pub fn delivered_sweep(
    messages: &[ChatMessage],
    me: &str,
    partner: &str,
    conversation_id: &str,
    online: &[PresenceRecord],
) -> Vec<StatusUpdate> {
    if !online.iter().any(|record| record.contact_id == partner) {
        return Vec::new();
    }

    messages
        .iter()
        .filter(|message| message.conversation_id == conversation_id)
        .filter(|message| message.sender_contact_id == me)
        .filter_map(|message| advance(message, MessageStatus::Sent, MessageStatus::Delivered))
        .collect()
}

/// Recipient-side sweep: every `delivered` message someone else sent that
/// reached this client becomes `read`.
pub fn read_sweep(messages: &[ChatMessage], me: &str) -> Vec<StatusUpdate> {
    messages
        .iter()
        .filter(|message| message.sender_contact_id != me)
        .filter_map(|message| advance(message, MessageStatus::Delivered, MessageStatus::Read))
        .collect()
}

fn advance(message: &ChatMessage, from: MessageStatus, to: MessageStatus) -> Option<StatusUpdate> {
    (message.status == from && from.can_advance_to(to)).then(|| StatusUpdate {
        message_id: message.id.clone(),
        from,
        to,
    })
}

/// Rebuilds the displayed list from a full snapshot: one entry per id,
/// newest first. Later duplicates win.
pub fn merge_snapshot(snapshot: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut by_id: HashMap<String, ChatMessage> = HashMap::with_capacity(snapshot.len());
    for message in snapshot {
        by_id.insert(message.id.clone(), message);
    }

    let mut ordered: Vec<ChatMessage> = by_id.into_values().collect();
    ordered.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}
