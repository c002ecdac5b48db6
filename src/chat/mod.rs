pub mod client;
pub mod reconciler;
pub mod state;

pub use client::{ChatClient, ChatSettings};
pub use state::{ChatState, Effect, MessageRow, Notice, Session, Transition, ViewModel};
