use crate::chat::{MessageRow, ViewModel};
use crate::common::MessageStatus;

fn ticks(status: Option<MessageStatus>) -> &'static str {
    match status {
        None => "",
        Some(MessageStatus::Sent) => " ✓",
        Some(MessageStatus::Delivered) => " ✓✓",
        Some(MessageStatus::Read) => " ✓✓ read",
    }
}

fn render_row(row: &MessageRow) -> String {
    let message = &row.message;
    format!(
        "[{}] {}: {}{}",
        message.created_at.format("%H:%M"),
        message.sender_display_name,
        message.content,
        ticks(row.ticks)
    )
}

/// Conversation pane, oldest message first like a terminal scrollback.
pub fn render(view: &ViewModel) -> Vec<String> {
    let Some(partner) = &view.partner else {
        return vec!["No conversation open; /with <phone> to start one".to_string()];
    };

    let mut lines = vec![format!("Chat with {partner}")];
    if view.loading {
        lines.push("Loading...".to_string());
    } else if view.ordered_messages.is_empty() {
        lines.push("No messages yet".to_string());
    }
    lines.extend(view.ordered_messages.iter().rev().map(render_row));
    lines
}
