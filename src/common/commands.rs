/// Commands the presentation layer sends to the chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Join with a display name and contact id (phone number).
    Join {
        display_name: String,
        contact_id: String,
    },
    /// Open the conversation with another participant.
    SelectPartner { contact_id: String },
    SendMessage(String),
    /// First step of clearing the active conversation.
    RequestClear,
    /// Second step; deletes every message of the active conversation.
    ConfirmClear,
    CancelClear,
    /// App came back to the foreground; republish presence.
    Foreground,
    /// Forget the persisted identity.
    Logout,
}
