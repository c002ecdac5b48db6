use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::chat::ViewModel;
use crate::common::{ChatCommand, ChatEvent, ClearReport};
use crate::tabs::{ALL_TABS, Tab};

use super::components::input_bar::{self, InputAction};
use super::components::{chat_area, sidebar};

/// Full terminal frame for one view model.
pub fn render_screen(view: &ViewModel) -> String {
    let mut lines = Vec::new();
    let tabs: Vec<String> = ALL_TABS
        .iter()
        .map(|tab| match tab {
            Tab::Community => format!("[{}]", tab.title()),
            other => other.title().to_string(),
        })
        .collect();
    lines.push(tabs.join(" | "));

    match &view.me {
        Some(me) => lines.push(format!("You: {} ({})", me.display_name, me.contact_id)),
        None => lines.push("Not joined; /join <name> <phone>".to_string()),
    }
    if view.me.is_some() {
        lines.push(sidebar::render(view));
        lines.extend(chat_area::render(view));
    }
    if view.clear_pending {
        lines.push("Delete this whole conversation for both of you? /confirm or /cancel".into());
    }
    if let Some(notice) = &view.notice {
        lines.push(format!("! {notice}"));
    }
    lines.join("\n")
}

fn render_clear_report(report: &ClearReport) -> String {
    if report.is_complete() {
        format!(
            "Conversation {} cleared ({} message(s))",
            report.conversation_id, report.deleted
        )
    } else {
        format!(
            "Conversation {} partly cleared; still present: {}",
            report.conversation_id,
            report.survivors.join(", ")
        )
    }
}

/// Line-oriented front end for the Community tab.
pub struct TerminalApp<W: Write> {
    command_sender: mpsc::Sender<ChatCommand>,
    event_receiver: mpsc::Receiver<ChatEvent>,
    out: W,
}

impl<W: Write> TerminalApp<W> {
    pub fn new(
        command_sender: mpsc::Sender<ChatCommand>,
        event_receiver: mpsc::Receiver<ChatEvent>,
        out: W,
    ) -> Self {
        Self {
            command_sender,
            event_receiver,
            out,
        }
    }

    /// Reads commands from `input` until `/quit`, end of input or the
    /// chat client going away.
    pub async fn run<R>(mut self, input: R) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match input_bar::parse(&line) {
                        None => {}
                        Some(InputAction::Command(command)) => {
                            if self.command_sender.send(command).await.is_err() {
                                log::warn!("Chat client is gone; leaving");
                                break;
                            }
                        }
                        Some(InputAction::Help) => writeln!(self.out, "{}", input_bar::HELP)?,
                        Some(InputAction::Invalid(reason)) => writeln!(self.out, "! {reason}")?,
                        Some(InputAction::Quit) => break,
                    }
                }
                event = self.event_receiver.recv() => {
                    match event {
                        Some(event) => self.handle_event(event)?,
                        None => break,
                    }
                }
            }
        }
        self.out.flush()
    }

    fn handle_event(&mut self, event: ChatEvent) -> std::io::Result<()> {
        match event {
            ChatEvent::ViewModelChanged(view) => {
                writeln!(self.out, "\n{}", render_screen(&view))?;
            }
            ChatEvent::ConversationCleared(report) => {
                writeln!(self.out, "{}", render_clear_report(&report))?;
            }
        }
        self.out.flush()
    }
}
