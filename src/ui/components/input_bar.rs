use crate::common::ChatCommand;

/// What one line typed at the prompt asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Command(ChatCommand),
    Help,
    Quit,
    Invalid(String),
}

pub const HELP: &str = "\
/join <name> <phone>   join the chat (name may contain spaces)
/with <phone>          open the conversation with someone
/clear                 ask to delete this conversation
/confirm | /cancel     answer a pending clear
/here                  announce that you are online now
/logout                forget the saved identity
/quit                  leave
anything else          send it as a message";

/// Parses one prompt line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<InputAction> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(InputAction::Command(ChatCommand::SendMessage(line.to_string())));
    };

    let (verb, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let args = args.trim();
    let action = match verb {
        "join" => match args.rsplit_once(char::is_whitespace) {
            Some((name, phone)) => InputAction::Command(ChatCommand::Join {
                display_name: name.trim().to_string(),
                contact_id: phone.to_string(),
            }),
            None => InputAction::Invalid("usage: /join <name> <phone>".into()),
        },
        "with" if !args.is_empty() => InputAction::Command(ChatCommand::SelectPartner {
            contact_id: args.to_string(),
        }),
        "with" => InputAction::Invalid("usage: /with <phone>".into()),
        "clear" => InputAction::Command(ChatCommand::RequestClear),
        "confirm" => InputAction::Command(ChatCommand::ConfirmClear),
        "cancel" => InputAction::Command(ChatCommand::CancelClear),
        "here" => InputAction::Command(ChatCommand::Foreground),
        "logout" => InputAction::Command(ChatCommand::Logout),
        "help" => InputAction::Help,
        "quit" | "exit" => InputAction::Quit,
        other => InputAction::Invalid(format!("unknown command /{other}; try /help")),
    };
    Some(action)
}
