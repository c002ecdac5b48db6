use super::types::ClearReport;
use crate::chat::ViewModel;

/// Events the chat session sends up to the presentation layer.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ViewModelChanged(ViewModel),
    ConversationCleared(ClearReport),
}
