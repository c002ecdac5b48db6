use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, pending};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::state::{ChatState, Effect, Notice, Transition, ViewModel};
use crate::channel::{
    MessageChannel, MessageSnapshot, PresenceChannel, Subscription, clear_conversation,
};
use crate::common::{ChatCommand, ChatEvent, StatusUpdate};
use crate::error::ChannelError;
use crate::storage::IdentityStore;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Presence older than this no longer counts as online.
    pub presence_ttl: chrono::Duration,
    /// How often presence is republished while joined.
    pub heartbeat: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            presence_ttl: chrono::Duration::seconds(300),
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Drives one chat screen: applies commands and snapshots to [`ChatState`],
/// executes the resulting effects and reports view model changes.
pub struct ChatClient {
    event_sender: mpsc::Sender<ChatEvent>,
    command_receiver: mpsc::Receiver<ChatCommand>,
    identity: IdentityStore,
    messages: Arc<dyn MessageChannel>,
    presence: Arc<dyn PresenceChannel>,
    state: ChatState,
    conversation: Option<Subscription<MessageSnapshot>>,
    heartbeat: Duration,
    last_view: Option<ViewModel>,
}

impl ChatClient {
    pub fn new(
        event_sender: mpsc::Sender<ChatEvent>,
        command_receiver: mpsc::Receiver<ChatCommand>,
        identity: IdentityStore,
        messages: Arc<dyn MessageChannel>,
        presence: Arc<dyn PresenceChannel>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            event_sender,
            command_receiver,
            identity,
            messages,
            presence,
            state: ChatState::new(settings.presence_ttl, Utc::now()),
            conversation: None,
            heartbeat: settings.heartbeat,
            last_view: None,
        }
    }

    /// Runs until the command sender is dropped.
    pub async fn run(mut self) {
        match self.identity.load() {
            Ok(Some(participant)) => self.dispatch(Transition::Restore(participant)).await,
            Ok(None) => log::info!("No saved identity; waiting for join"),
            Err(err) => {
                log::warn!("Failed to read saved identity: {err}");
                self.dispatch(Transition::Failed(Notice::Storage(err.to_string())))
                    .await;
            }
        }

        let mut presence = self.presence.subscribe_presence();
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.publish_view().await;
        log::info!("Chat session started");

        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                item = next_snapshot(&mut self.conversation) => {
                    match item {
                        Some(Ok(snapshot)) => {
                            log::debug!(
                                "Message snapshot for {}: {} message(s)",
                                snapshot.conversation_id,
                                snapshot.messages.len()
                            );
                            self.dispatch(Transition::MessageSnapshot {
                                conversation_id: snapshot.conversation_id,
                                messages: snapshot.messages,
                            })
                            .await;
                        }
                        Some(Err(err)) => self.remote_failure("Message subscription error", err).await,
                        None => {
                            log::warn!("Message subscription ended");
                            self.conversation = None;
                        }
                    }
                }
                item = presence.next() => {
                    match item {
                        Some(Ok(records)) => {
                            log::debug!("Presence snapshot: {} record(s)", records.len());
                            self.dispatch(Transition::PresenceSnapshot(records)).await;
                        }
                        Some(Err(err)) => self.remote_failure("Presence subscription error", err).await,
                        None => {
                            log::warn!("Presence subscription ended; resubscribing");
                            presence = self.presence.subscribe_presence();
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.dispatch(Transition::Tick(Utc::now())).await;
                    self.dispatch(Transition::Foreground).await;
                }
            }
        }

        log::info!("Chat session stopped");
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        let transition = match command {
            ChatCommand::Join {
                display_name,
                contact_id,
            } => Transition::Join {
                display_name,
                contact_id,
            },
            ChatCommand::SelectPartner { contact_id } => Transition::SelectPartner(contact_id),
            ChatCommand::SendMessage(content) => Transition::Send(content),
            ChatCommand::RequestClear => Transition::RequestClear,
            ChatCommand::ConfirmClear => Transition::ConfirmClear,
            ChatCommand::CancelClear => Transition::CancelClear,
            ChatCommand::Foreground => Transition::Foreground,
            ChatCommand::Logout => Transition::Logout,
        };
        self.dispatch(transition).await;
    }

    /// Applies a transition and every follow-up it causes, then publishes
    /// the view model once.
    async fn dispatch(&mut self, transition: Transition) {
        let mut queue = VecDeque::from([transition]);
        while let Some(transition) = queue.pop_front() {
            for effect in self.state.apply(transition) {
                queue.extend(self.execute(effect).await);
            }
        }
        self.publish_view().await;
    }

    async fn execute(&mut self, effect: Effect) -> Vec<Transition> {
        match effect {
            Effect::PersistIdentity(participant) => match self.identity.save(&participant) {
                Ok(()) => Vec::new(),
                Err(err) => {
                    log::warn!("Failed to persist identity: {err}");
                    vec![Transition::Failed(Notice::Storage(err.to_string()))]
                }
            },
            Effect::ForgetIdentity => match self.identity.clear() {
                Ok(()) => Vec::new(),
                Err(err) => {
                    log::warn!("Failed to clear identity: {err}");
                    vec![Transition::Failed(Notice::Storage(err.to_string()))]
                }
            },
            Effect::PublishPresence(participant) => {
                match self.presence.upsert(&participant).await {
                    Ok(()) => Vec::new(),
                    Err(err) => vec![remote_notice("Failed to publish presence", err)],
                }
            }
            Effect::Subscribe(conversation_id) => {
                log::info!("Subscribing to conversation {conversation_id}");
                // Replacing the handle drops, and so cancels, the previous one.
                self.conversation = Some(self.messages.subscribe_conversation(&conversation_id));
                Vec::new()
            }
            Effect::Unsubscribe => {
                self.conversation = None;
                Vec::new()
            }
            Effect::CreateMessage(message) => match self.messages.create(message).await {
                Ok(id) => {
                    log::debug!("Message {id} sent");
                    Vec::new()
                }
                Err(err) => vec![remote_notice("Failed to send message", err)],
            },
            Effect::UpdateStatuses(updates) => {
                update_statuses(self.messages.as_ref(), updates).await
            }
            Effect::DeleteConversation(conversation_id) => {
                match clear_conversation(self.messages.as_ref(), &conversation_id).await {
                    Ok(report) => {
                        if let Err(err) = self
                            .event_sender
                            .send(ChatEvent::ConversationCleared(report.clone()))
                            .await
                        {
                            log::warn!("Failed to notify UI about cleared chat: {err}");
                        }
                        vec![Transition::Cleared(report)]
                    }
                    Err(err) => vec![remote_notice("Failed to clear conversation", err)],
                }
            }
        }
    }

    async fn remote_failure(&mut self, context: &str, err: ChannelError) {
        let transition = remote_notice(context, err);
        self.dispatch(transition).await;
    }

    async fn publish_view(&mut self) {
        let view = self.state.view_model();
        if self.last_view.as_ref() == Some(&view) {
            return;
        }
        self.last_view = Some(view.clone());
        if let Err(err) = self
            .event_sender
            .send(ChatEvent::ViewModelChanged(view))
            .await
        {
            log::warn!("Failed to deliver view model to UI: {err}");
        }
    }
}

fn remote_notice(context: &str, err: ChannelError) -> Transition {
    log::warn!("{context}: {err}");
    Transition::Failed(Notice::Remote(err.to_string()))
}

/// Issues every write independently; failed ones become eligible again.
/// A write skipped because the stored status moved on stays in flight until
/// a snapshot shows the newer status.
async fn update_statuses(
    messages: &dyn MessageChannel,
    updates: Vec<StatusUpdate>,
) -> Vec<Transition> {
    let results = join_all(updates.iter().map(|update| messages.update_status(update))).await;

    updates
        .into_iter()
        .zip(results)
        .filter_map(|(update, result)| match result {
            Ok(true) => {
                log::debug!(
                    "Message {} advanced {} -> {}",
                    update.message_id,
                    update.from,
                    update.to
                );
                None
            }
            Ok(false) => {
                log::debug!(
                    "Message {} was no longer {}; left as stored",
                    update.message_id,
                    update.from
                );
                None
            }
            Err(ChannelError::NotFound(_)) => {
                log::debug!("Message {} vanished before status write", update.message_id);
                Some(Transition::StatusWriteFailed(update.message_id))
            }
            Err(err) => {
                log::warn!("Failed to mark {} as {}: {err}", update.message_id, update.to);
                Some(Transition::StatusWriteFailed(update.message_id))
            }
        })
        .collect()
}

async fn next_snapshot(
    subscription: &mut Option<Subscription<MessageSnapshot>>,
) -> Option<Result<MessageSnapshot, ChannelError>> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryHub;
    use crate::chat::reconciler::conversation_id;
    use crate::common::{ChatMessage, MessageStatus, NewMessage, Participant, PresenceRecord};
    use crate::error::StoreError;
    use crate::storage::{KeyValueStore, SqliteKeyValueStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;

    /// A device whose disk is full.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk unavailable")))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk unavailable")))
        }
    }

    fn unreachable_backend() -> ChannelError {
        ChannelError::Rejected {
            status: 503,
            message: "backend unreachable".into(),
        }
    }

    fn silent<T: Send + 'static>() -> Subscription<T> {
        Subscription::spawn(|sender| async move {
            let _sender = sender;
            pending::<()>().await
        })
    }

    /// Backend that refuses every write and never delivers a snapshot.
    struct Offline;

    #[async_trait]
    impl MessageChannel for Offline {
        async fn create(&self, _message: NewMessage) -> Result<String, ChannelError> {
            Err(unreachable_backend())
        }

        async fn update_status(&self, _update: &StatusUpdate) -> Result<bool, ChannelError> {
            Err(unreachable_backend())
        }

        async fn delete(&self, _message_id: &str) -> Result<(), ChannelError> {
            Err(unreachable_backend())
        }

        async fn query(&self, _conversation_id: &str) -> Result<Vec<ChatMessage>, ChannelError> {
            Err(unreachable_backend())
        }

        fn subscribe_conversation(&self, _conversation_id: &str) -> Subscription<MessageSnapshot> {
            silent()
        }
    }

    #[async_trait]
    impl PresenceChannel for Offline {
        async fn upsert(&self, _participant: &Participant) -> Result<(), ChannelError> {
            Err(unreachable_backend())
        }

        fn subscribe_presence(&self) -> Subscription<Vec<PresenceRecord>> {
            silent()
        }
    }

    /// Hub whose first few status writes fail.
    struct FlakyStatusWrites {
        hub: MemoryHub,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MessageChannel for FlakyStatusWrites {
        async fn create(&self, message: NewMessage) -> Result<String, ChannelError> {
            self.hub.create(message).await
        }

        async fn update_status(&self, update: &StatusUpdate) -> Result<bool, ChannelError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(unreachable_backend());
            }
            self.hub.update_status(update).await
        }

        async fn delete(&self, message_id: &str) -> Result<(), ChannelError> {
            self.hub.delete(message_id).await
        }

        async fn query(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChannelError> {
            self.hub.query(conversation_id).await
        }

        fn subscribe_conversation(&self, conversation_id: &str) -> Subscription<MessageSnapshot> {
            self.hub.subscribe_conversation(conversation_id)
        }
    }

    struct Harness {
        commands: mpsc::Sender<ChatCommand>,
        events: mpsc::Receiver<ChatEvent>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(hub: &MemoryHub, identity: IdentityStore) -> Self {
            Self::start_with(
                identity,
                Arc::new(hub.clone()),
                Arc::new(hub.clone()),
                ChatSettings::default(),
            )
        }

        fn start_with(
            identity: IdentityStore,
            messages: Arc<dyn MessageChannel>,
            presence: Arc<dyn PresenceChannel>,
            settings: ChatSettings,
        ) -> Self {
            let (commands, command_receiver) = mpsc::channel(16);
            let (event_sender, events) = mpsc::channel(256);
            let client = ChatClient::new(
                event_sender,
                command_receiver,
                identity,
                messages,
                presence,
                settings,
            );
            let task = tokio::spawn(client.run());
            Self {
                commands,
                events,
                task,
            }
        }

        fn fresh(hub: &MemoryHub) -> Self {
            Self::start(hub, empty_identity())
        }

        async fn send(&self, command: ChatCommand) {
            self.commands.send(command).await.unwrap();
        }

        async fn join(&self, name: &str, contact_id: &str) {
            self.send(ChatCommand::Join {
                display_name: name.into(),
                contact_id: contact_id.into(),
            })
            .await;
        }

        async fn wait_for(&mut self, predicate: impl Fn(&ViewModel) -> bool) -> ViewModel {
            let deadline = Duration::from_secs(3);
            tokio::time::timeout(deadline, async {
                loop {
                    match self.events.recv().await {
                        Some(ChatEvent::ViewModelChanged(view)) if predicate(&view) => {
                            return view;
                        }
                        Some(_) => continue,
                        None => panic!("chat client stopped"),
                    }
                }
            })
            .await
            .expect("view model never matched")
        }

        async fn wait_for_cleared(&mut self) -> crate::common::ClearReport {
            tokio::time::timeout(Duration::from_secs(3), async {
                loop {
                    match self.events.recv().await {
                        Some(ChatEvent::ConversationCleared(report)) => return report,
                        Some(_) => continue,
                        None => panic!("chat client stopped"),
                    }
                }
            })
            .await
            .expect("clear never reported")
        }

        async fn stop(self) {
            drop(self.commands);
            self.task.await.unwrap();
        }
    }

    fn empty_identity() -> IdentityStore {
        IdentityStore::new(Box::new(SqliteKeyValueStore::in_memory().unwrap()))
    }

    fn first_ticks(view: &ViewModel) -> Option<MessageStatus> {
        view.ordered_messages.first().and_then(|row| row.ticks)
    }

    #[tokio::test]
    async fn message_goes_sent_delivered_read() {
        let hub = MemoryHub::new();
        let mut amina = Harness::fresh(&hub);
        amina.join("Amina", "111").await;
        amina.send(ChatCommand::SelectPartner { contact_id: "222".into() }).await;
        amina.send(ChatCommand::SendMessage("hello".into())).await;

        let view = amina
            .wait_for(|view| first_ticks(view) == Some(MessageStatus::Sent))
            .await;
        assert_eq!(view.conversation_id, Some(conversation_id("111", "222")));
        assert_eq!(view.ordered_messages[0].message.conversation_id, "111_222");
        assert_eq!(view.ordered_messages[0].message.content, "hello");

        // Bashir comes online: Amina's presence sweep marks the message delivered.
        let mut bashir = Harness::fresh(&hub);
        bashir.join("Bashir", "222").await;
        amina
            .wait_for(|view| first_ticks(view) == Some(MessageStatus::Delivered))
            .await;

        // Bashir opens the chat: his snapshot sweep marks it read.
        bashir.send(ChatCommand::SelectPartner { contact_id: "111".into() }).await;
        let seen = bashir
            .wait_for(|view| {
                view.ordered_messages
                    .first()
                    .is_some_and(|row| row.message.status == MessageStatus::Read)
            })
            .await;
        assert_eq!(seen.ordered_messages[0].ticks, None);

        amina
            .wait_for(|view| first_ticks(view) == Some(MessageStatus::Read))
            .await;

        amina.stop().await;
        bashir.stop().await;
    }

    #[tokio::test]
    async fn saved_identity_is_restored_and_published() {
        let hub = MemoryHub::new();
        let identity = empty_identity();
        identity.save(&Participant::new("Amina", "111")).unwrap();

        let mut amina = Harness::start(&hub, identity);
        let view = amina.wait_for(|view| view.me.is_some()).await;
        assert_eq!(view.me, Some(Participant::new("Amina", "111")));

        let mut bashir = Harness::fresh(&hub);
        bashir.join("Bashir", "222").await;
        let view = bashir
            .wait_for(|view| view.online_participants.iter().any(|p| p.contact_id == "111"))
            .await;
        assert!(view.online_participants.iter().all(|p| p.contact_id != "222"));

        amina.stop().await;
        bashir.stop().await;
    }

    #[tokio::test]
    async fn clearing_removes_only_active_conversation() {
        let hub = MemoryHub::new();
        let mut amina = Harness::fresh(&hub);
        amina.join("Amina", "111").await;

        amina.send(ChatCommand::SelectPartner { contact_id: "333".into() }).await;
        amina.send(ChatCommand::SendMessage("for 333".into())).await;
        amina.wait_for(|view| view.ordered_messages.len() == 1).await;

        amina.send(ChatCommand::SelectPartner { contact_id: "222".into() }).await;
        amina.send(ChatCommand::SendMessage("one".into())).await;
        amina.send(ChatCommand::SendMessage("two".into())).await;
        amina
            .wait_for(|view| {
                view.conversation_id.as_deref() == Some("111_222")
                    && view.ordered_messages.len() == 2
            })
            .await;

        amina.send(ChatCommand::RequestClear).await;
        amina.send(ChatCommand::ConfirmClear).await;
        let report = amina.wait_for_cleared().await;
        assert_eq!(report.conversation_id, "111_222");
        assert_eq!(report.deleted, 2);

        amina
            .wait_for(|view| view.ordered_messages.is_empty() && !view.loading)
            .await;
        let left = hub.all_messages();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].conversation_id, "111_333");

        amina.stop().await;
    }

    #[tokio::test]
    async fn send_before_selecting_partner_is_rejected() {
        let hub = MemoryHub::new();
        let mut amina = Harness::fresh(&hub);
        amina.join("Amina", "111").await;
        amina.send(ChatCommand::SendMessage("hello?".into())).await;

        amina
            .wait_for(|view| view.notice == Some(Notice::NoConversation))
            .await;
        assert!(hub.all_messages().is_empty());

        amina.stop().await;
    }

    #[tokio::test]
    async fn failed_identity_write_keeps_session_joined() {
        let hub = MemoryHub::new();
        let mut amina = Harness::start(&hub, IdentityStore::new(Box::new(BrokenStore)));
        amina
            .wait_for(|view| matches!(view.notice, Some(Notice::Storage(_))))
            .await;

        amina.join("Amina", "111").await;
        let view = amina
            .wait_for(|view| view.me.is_some() && matches!(view.notice, Some(Notice::Storage(_))))
            .await;
        assert_eq!(view.me, Some(Participant::new("Amina", "111")));

        // Presence went out even though the local save did not.
        let mut bashir = Harness::fresh(&hub);
        bashir.join("Bashir", "222").await;
        bashir
            .wait_for(|view| view.online_participants.iter().any(|p| p.contact_id == "111"))
            .await;

        amina.stop().await;
        bashir.stop().await;
    }

    #[tokio::test]
    async fn remote_failures_surface_and_loop_keeps_running() {
        let offline = Arc::new(Offline);
        let mut amina = Harness::start_with(
            empty_identity(),
            offline.clone(),
            offline,
            ChatSettings::default(),
        );

        amina.join("Amina", "111").await;
        let view = amina
            .wait_for(|view| view.me.is_some() && matches!(view.notice, Some(Notice::Remote(_))))
            .await;
        assert_eq!(view.me, Some(Participant::new("Amina", "111")));

        amina.send(ChatCommand::SelectPartner { contact_id: "222".into() }).await;
        amina.wait_for(|view| view.partner.is_some() && view.notice.is_none()).await;
        amina.send(ChatCommand::SendMessage("anyone there?".into())).await;
        amina
            .wait_for(|view| matches!(view.notice, Some(Notice::Remote(_))))
            .await;

        amina.send(ChatCommand::SendMessage("   ".into())).await;
        amina
            .wait_for(|view| view.notice == Some(Notice::EmptyMessage))
            .await;

        amina.stop().await;
    }

    #[tokio::test]
    async fn failed_status_write_is_retried() {
        let hub = MemoryHub::new();
        let flaky = Arc::new(FlakyStatusWrites {
            hub: hub.clone(),
            failures_left: AtomicUsize::new(1),
        });
        let settings = ChatSettings {
            heartbeat: Duration::from_millis(50),
            ..ChatSettings::default()
        };
        let mut amina =
            Harness::start_with(empty_identity(), flaky.clone(), Arc::new(hub.clone()), settings);
        amina.join("Amina", "111").await;
        amina.send(ChatCommand::SelectPartner { contact_id: "222".into() }).await;
        amina.send(ChatCommand::SendMessage("hello".into())).await;
        amina
            .wait_for(|view| first_ticks(view) == Some(MessageStatus::Sent))
            .await;

        let mut bashir = Harness::fresh(&hub);
        bashir.join("Bashir", "222").await;
        amina
            .wait_for(|view| first_ticks(view) == Some(MessageStatus::Delivered))
            .await;
        assert_eq!(flaky.failures_left.load(Ordering::SeqCst), 0);

        amina.stop().await;
        bashir.stop().await;
    }

    #[tokio::test]
    async fn stale_presence_drops_partner_from_online_list() {
        let hub = MemoryHub::new();
        let mut amina = Harness::fresh(&hub);
        amina.join("Amina", "111").await;
        let mut bashir = Harness::fresh(&hub);
        bashir.join("Bashir", "222").await;
        amina
            .wait_for(|view| view.online_participants.iter().any(|p| p.contact_id == "222"))
            .await;

        // Bashir's phone stopped heartbeating ten minutes ago.
        hub.set_last_active("222", Utc::now() - chrono::Duration::minutes(10));
        amina
            .wait_for(|view| view.me.is_some() && view.online_participants.is_empty())
            .await;

        amina.stop().await;
        bashir.stop().await;
    }
}
