use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use super::reconciler::{
    CONVERSATION_ID_DELIMITER, conversation_id, delivered_sweep, derive_status,
    merge_snapshot, online_participants, read_sweep,
};
use crate::common::{
    ChatMessage, ClearReport, MessageStatus, NewMessage, Participant, PresenceRecord,
    StatusUpdate,
};

/// Who is using this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    Anonymous,
    Joined(Participant),
}

/// Every way the chat state can change. One variant per event source.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Identity loaded from the on-device store at start-up.
    Restore(Participant),
    Join {
        display_name: String,
        contact_id: String,
    },
    SelectPartner(String),
    Send(String),
    RequestClear,
    ConfirmClear,
    CancelClear,
    Foreground,
    Logout,
    MessageSnapshot {
        conversation_id: String,
        messages: Vec<ChatMessage>,
    },
    PresenceSnapshot(Vec<PresenceRecord>),
    Tick(DateTime<Utc>),
    /// A status write failed; it may be retried by a later sweep.
    StatusWriteFailed(String),
    Cleared(ClearReport),
    Failed(Notice),
}

/// Side effects requested by a transition, executed by the session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    PersistIdentity(Participant),
    PublishPresence(Participant),
    /// Replace the message subscription with one for this conversation.
    Subscribe(String),
    Unsubscribe,
    CreateMessage(NewMessage),
    UpdateStatuses(Vec<StatusUpdate>),
    DeleteConversation(String),
    ForgetIdentity,
}

/// Non-blocking status shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    MissingJoinFields,
    InvalidContactId,
    AlreadyJoined,
    NotJoined,
    NoConversation,
    SelfChat,
    EmptyMessage,
    ConfirmClear,
    NothingToConfirm,
    Cleared { deleted: usize },
    ClearIncomplete { deleted: usize, survivors: usize },
    Storage(String),
    Remote(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::MissingJoinFields => f.write_str("Please enter both your name and phone number"),
            Notice::InvalidContactId => write!(
                f,
                "Phone number may not contain '{CONVERSATION_ID_DELIMITER}' or '/'"
            ),
            Notice::AlreadyJoined => f.write_str("You have already joined"),
            Notice::NotJoined => f.write_str("Join the chat first"),
            Notice::NoConversation => f.write_str("Select someone to chat with first"),
            Notice::SelfChat => f.write_str("You cannot start a chat with yourself"),
            Notice::EmptyMessage => f.write_str("Message is empty"),
            Notice::ConfirmClear => f.write_str("Delete every message in this chat? Confirm to continue"),
            Notice::NothingToConfirm => f.write_str("No clear request is pending"),
            Notice::Cleared { deleted } => write!(f, "Chat cleared ({deleted} messages deleted)"),
            Notice::ClearIncomplete { deleted, survivors } => write!(
                f,
                "Chat partly cleared: {deleted} deleted, {survivors} could not be deleted"
            ),
            Notice::Storage(err) => write!(f, "Could not save locally: {err}"),
            Notice::Remote(err) => write!(f, "Connection problem: {err}"),
        }
    }
}

/// A message as displayed: tick marks only on the viewer's own messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub message: ChatMessage,
    pub ticks: Option<MessageStatus>,
}

/// Render-ready output, rebuilt from scratch after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewModel {
    pub me: Option<Participant>,
    pub partner: Option<String>,
    pub conversation_id: Option<String>,
    pub loading: bool,
    /// Newest first.
    pub ordered_messages: Vec<MessageRow>,
    /// Online participants other than the viewer.
    pub online_participants: Vec<PresenceRecord>,
    pub clear_pending: bool,
    pub notice: Option<Notice>,
}

/// Explicit chat state container. All mutation goes through [`ChatState::apply`].
#[derive(Debug)]
pub struct ChatState {
    session: Session,
    partner: Option<String>,
    conversation_id: Option<String>,
    messages: Vec<ChatMessage>,
    presence: HashMap<String, PresenceRecord>,
    loading: bool,
    pending_clear: Option<String>,
    /// Status writes issued but not yet reflected by a snapshot.
    in_flight: HashMap<String, MessageStatus>,
    notice: Option<Notice>,
    now: DateTime<Utc>,
    presence_ttl: Duration,
}

impl ChatState {
    pub fn new(presence_ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            session: Session::Anonymous,
            partner: None,
            conversation_id: None,
            messages: Vec::new(),
            presence: HashMap::new(),
            loading: false,
            pending_clear: None,
            in_flight: HashMap::new(),
            notice: None,
            now,
            presence_ttl,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn me(&self) -> Option<&Participant> {
        match &self.session {
            Session::Joined(participant) => Some(participant),
            Session::Anonymous => None,
        }
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn apply(&mut self, transition: Transition) -> Vec<Effect> {
        match transition {
            Transition::Restore(participant) => self.restore(participant),
            Transition::Join {
                display_name,
                contact_id,
            } => self.join(&display_name, &contact_id),
            Transition::SelectPartner(contact_id) => self.select_partner(&contact_id),
            Transition::Send(content) => self.send(&content),
            Transition::RequestClear => self.request_clear(),
            Transition::ConfirmClear => self.confirm_clear(),
            Transition::CancelClear => {
                self.notice = None;
                self.pending_clear = None;
                Vec::new()
            }
            Transition::Foreground => match self.me() {
                Some(me) => vec![Effect::PublishPresence(me.clone())],
                None => Vec::new(),
            },
            Transition::Logout => self.logout(),
            Transition::MessageSnapshot {
                conversation_id,
                messages,
            } => self.on_message_snapshot(conversation_id, messages),
            Transition::PresenceSnapshot(records) => self.on_presence_snapshot(records),
            Transition::Tick(now) => {
                self.now = now;
                self.status_sweep(false)
            }
            Transition::StatusWriteFailed(message_id) => {
                self.in_flight.remove(&message_id);
                Vec::new()
            }
            Transition::Cleared(report) => {
                self.notice = Some(if report.is_complete() {
                    Notice::Cleared {
                        deleted: report.deleted,
                    }
                } else {
                    Notice::ClearIncomplete {
                        deleted: report.deleted,
                        survivors: report.survivors.len(),
                    }
                });
                Vec::new()
            }
            Transition::Failed(notice) => {
                self.notice = Some(notice);
                Vec::new()
            }
        }
    }

    fn restore(&mut self, participant: Participant) -> Vec<Effect> {
        log::info!("Restored identity for {}", participant.contact_id);
        self.session = Session::Joined(participant.clone());
        vec![Effect::PublishPresence(participant)]
    }

    fn join(&mut self, display_name: &str, contact_id: &str) -> Vec<Effect> {
        if self.me().is_some() {
            self.notice = Some(Notice::AlreadyJoined);
            return Vec::new();
        }

        let display_name = display_name.trim();
        let contact_id = contact_id.trim();
        if display_name.is_empty() || contact_id.is_empty() {
            self.notice = Some(Notice::MissingJoinFields);
            return Vec::new();
        }
        if contact_id.contains([CONVERSATION_ID_DELIMITER, '/']) {
            self.notice = Some(Notice::InvalidContactId);
            return Vec::new();
        }

        let participant = Participant::new(display_name, contact_id);
        log::info!("Joined as {} ({})", participant.display_name, participant.contact_id);
        self.notice = None;
        self.session = Session::Joined(participant.clone());
        vec![
            Effect::PersistIdentity(participant.clone()),
            Effect::PublishPresence(participant),
        ]
    }

    fn select_partner(&mut self, contact_id: &str) -> Vec<Effect> {
        let Some(me) = self.me() else {
            self.notice = Some(Notice::NotJoined);
            return Vec::new();
        };
        let partner = contact_id.trim();
        if partner.is_empty() {
            self.notice = Some(Notice::NoConversation);
            return Vec::new();
        }
        if partner == me.contact_id {
            self.notice = Some(Notice::SelfChat);
            return Vec::new();
        }

        let id = conversation_id(&me.contact_id, partner);
        log::debug!("Selected partner {partner}; conversation {id}");
        self.partner = Some(partner.to_string());
        self.conversation_id = Some(id.clone());
        self.messages.clear();
        self.in_flight.clear();
        self.pending_clear = None;
        self.loading = true;
        self.notice = None;
        vec![Effect::Subscribe(id)]
    }

    fn send(&mut self, content: &str) -> Vec<Effect> {
        let Some(me) = self.me().cloned() else {
            self.notice = Some(Notice::NotJoined);
            return Vec::new();
        };
        let Some(conversation_id) = self.conversation_id.clone() else {
            self.notice = Some(Notice::NoConversation);
            return Vec::new();
        };
        let content = content.trim();
        if content.is_empty() {
            self.notice = Some(Notice::EmptyMessage);
            return Vec::new();
        }

        self.notice = None;
        vec![Effect::CreateMessage(NewMessage {
            conversation_id,
            sender_contact_id: me.contact_id,
            sender_display_name: me.display_name,
            content: content.to_string(),
        })]
    }

    fn request_clear(&mut self) -> Vec<Effect> {
        match &self.conversation_id {
            Some(id) => {
                self.pending_clear = Some(id.clone());
                self.notice = Some(Notice::ConfirmClear);
            }
            None => self.notice = Some(Notice::NoConversation),
        }
        Vec::new()
    }

    fn confirm_clear(&mut self) -> Vec<Effect> {
        match self.pending_clear.take() {
            Some(id) if self.conversation_id.as_deref() == Some(id.as_str()) => {
                self.notice = None;
                vec![Effect::DeleteConversation(id)]
            }
            _ => {
                self.notice = Some(Notice::NothingToConfirm);
                Vec::new()
            }
        }
    }

    fn logout(&mut self) -> Vec<Effect> {
        self.session = Session::Anonymous;
        self.partner = None;
        self.conversation_id = None;
        self.messages.clear();
        self.in_flight.clear();
        self.pending_clear = None;
        self.loading = false;
        self.notice = None;
        vec![Effect::Unsubscribe, Effect::ForgetIdentity]
    }

    fn on_message_snapshot(
        &mut self,
        conversation_id: String,
        messages: Vec<ChatMessage>,
    ) -> Vec<Effect> {
        if self.conversation_id.as_deref() != Some(conversation_id.as_str()) {
            log::debug!("Discarding stale snapshot for conversation {conversation_id}");
            return Vec::new();
        }

        self.messages = merge_snapshot(messages);
        self.loading = false;

        let messages = &self.messages;
        self.in_flight.retain(|id, target| {
            messages
                .iter()
                .any(|message| &message.id == id && message.status < *target)
        });

        self.status_sweep(true)
    }

    fn on_presence_snapshot(&mut self, records: Vec<PresenceRecord>) -> Vec<Effect> {
        self.presence = records
            .into_iter()
            .map(|record| (record.contact_id.clone(), record))
            .collect();
        self.status_sweep(false)
    }

    /// Delivered sweep always; read sweep only when a message snapshot arrived.
    fn status_sweep(&mut self, include_read: bool) -> Vec<Effect> {
        let (Some(me), Some(partner), Some(id)) =
            (self.me(), self.partner.as_deref(), self.conversation_id.as_deref())
        else {
            return Vec::new();
        };

        let online = self.online();
        let mut updates = delivered_sweep(&self.messages, &me.contact_id, partner, id, &online);
        if include_read {
            updates.extend(read_sweep(&self.messages, &me.contact_id));
        }

        updates.retain(|update| self.in_flight.get(&update.message_id) != Some(&update.to));
        if updates.is_empty() {
            return Vec::new();
        }

        for update in &updates {
            self.in_flight.insert(update.message_id.clone(), update.to);
        }
        log::debug!("Status sweep produced {} update(s) in {}", updates.len(), id);
        vec![Effect::UpdateStatuses(updates)]
    }

    fn online(&self) -> Vec<PresenceRecord> {
        let records: Vec<PresenceRecord> = self.presence.values().cloned().collect();
        online_participants(&records, self.now, self.presence_ttl)
    }

    pub fn view_model(&self) -> ViewModel {
        let me = self.me().cloned();
        let viewer = me.as_ref().map(|p| p.contact_id.as_str()).unwrap_or_default();

        ViewModel {
            partner: self.partner.clone(),
            conversation_id: self.conversation_id.clone(),
            loading: self.loading,
            ordered_messages: self
                .messages
                .iter()
                .map(|message| MessageRow {
                    ticks: derive_status(message, viewer),
                    message: message.clone(),
                })
                .collect(),
            online_participants: self
                .online()
                .into_iter()
                .filter(|record| record.contact_id != viewer)
                .collect(),
            clear_pending: self.pending_clear.is_some(),
            notice: self.notice.clone(),
            me,
        }
    }
}
