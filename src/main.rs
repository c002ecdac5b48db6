use std::io;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use community_chat::channel::{FirestoreChannel, MemoryHub, MessageChannel, PresenceChannel};
use community_chat::chat::{ChatClient, ChatSettings, ViewModel};
use community_chat::common::{ChatCommand, ChatEvent, MessageStatus};
use community_chat::config::{self, AppConfig, Backend};
use community_chat::storage::{IdentityStore, SqliteKeyValueStore};
use community_chat::tabs::ALL_TABS;
use community_chat::ui::{TerminalApp, render_screen};
use dotenvy::dotenv;
use tokio::io::BufReader;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "community_chat",
    version,
    about = "Community tab chat with presence and delivery receipts"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Interactive chat on stdin/stdout (default)
    Chat,
    /// Two scripted participants on an in-process backend
    Demo,
    /// List the app tabs and the sites they embed
    Sites,
    /// Show the identity saved on this device
    Whoami,
    /// Forget the identity saved on this device
    Logout,
}

type Channels = (Arc<dyn MessageChannel>, Arc<dyn PresenceChannel>);

#[tokio::main]
async fn main() -> community_chat::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let mut app_config = config::load_config(&cli.config);
    app_config.apply_env();

    match cli.mode.unwrap_or(Mode::Chat) {
        Mode::Chat => run_chat(&app_config).await,
        Mode::Demo => {
            run_demo(app_config.chat_settings()).await;
            Ok(())
        }
        Mode::Sites => {
            for tab in ALL_TABS {
                match tab.embedded_url() {
                    Some(url) => println!("{:<10} {url}", tab.title()),
                    None => println!("{:<10} (chat)", tab.title()),
                }
            }
            Ok(())
        }
        Mode::Whoami => {
            match open_identity(&app_config)?.load()? {
                Some(me) => println!("{} ({})", me.display_name, me.contact_id),
                None => println!("Not joined on this device"),
            }
            Ok(())
        }
        Mode::Logout => {
            open_identity(&app_config)?.clear()?;
            println!("Saved identity removed");
            Ok(())
        }
    }
}

fn open_identity(app_config: &AppConfig) -> community_chat::Result<IdentityStore> {
    let store = SqliteKeyValueStore::with_path(&app_config.database_path)?;
    Ok(IdentityStore::new(Box::new(store)))
}

fn build_channels(app_config: &AppConfig) -> community_chat::Result<Channels> {
    match app_config.backend {
        Backend::Firestore => {
            let channel = Arc::new(FirestoreChannel::new(app_config.firestore_config()?));
            log::info!("Using Firestore project {}", app_config.firestore.project_id);
            let messages: Arc<dyn MessageChannel> = channel.clone();
            let presence: Arc<dyn PresenceChannel> = channel;
            Ok((messages, presence))
        }
        Backend::Memory => {
            log::warn!("Memory backend selected; messages stay inside this process");
            let hub = Arc::new(MemoryHub::new());
            let messages: Arc<dyn MessageChannel> = hub.clone();
            let presence: Arc<dyn PresenceChannel> = hub;
            Ok((messages, presence))
        }
    }
}

async fn run_chat(app_config: &AppConfig) -> community_chat::Result<()> {
    let identity = open_identity(app_config)?;
    let (messages, presence) = build_channels(app_config)?;

    // UI -> chat client
    let (cmd_tx, cmd_rx) = mpsc::channel(100);
    // chat client -> UI
    let (event_tx, event_rx) = mpsc::channel(100);

    let client = ChatClient::new(
        event_tx,
        cmd_rx,
        identity,
        messages,
        presence,
        app_config.chat_settings(),
    );
    let client_task = tokio::spawn(client.run());

    let app = TerminalApp::new(cmd_tx, event_rx, io::stdout());
    if let Err(err) = app.run(BufReader::new(tokio::io::stdin())).await {
        log::error!("Terminal closed unexpectedly: {err}");
    }

    // The app owned the only command sender, so the client now winds down.
    if let Err(err) = client_task.await {
        log::error!("Chat client terminated: {err}");
    }
    Ok(())
}

struct DemoParticipant {
    commands: mpsc::Sender<ChatCommand>,
    events: mpsc::Receiver<ChatEvent>,
}

impl DemoParticipant {
    fn start(hub: &MemoryHub, settings: ChatSettings) -> Option<Self> {
        let store = match SqliteKeyValueStore::in_memory() {
            Ok(store) => store,
            Err(err) => {
                log::error!("Demo identity store unavailable: {err}");
                return None;
            }
        };
        let (commands, cmd_rx) = mpsc::channel(16);
        let (event_tx, events) = mpsc::channel(256);
        let client = ChatClient::new(
            event_tx,
            cmd_rx,
            IdentityStore::new(Box::new(store)),
            Arc::new(hub.clone()),
            Arc::new(hub.clone()),
            settings,
        );
        tokio::spawn(client.run());
        Some(Self { commands, events })
    }

    async fn send(&self, command: ChatCommand) {
        if let Err(err) = self.commands.send(command).await {
            log::warn!("Demo client stopped: {err}");
        }
    }

    async fn wait_for(&mut self, predicate: impl Fn(&ViewModel) -> bool) -> Option<ViewModel> {
        let wait = async {
            while let Some(event) = self.events.recv().await {
                if let ChatEvent::ViewModelChanged(view) = event {
                    if predicate(&view) {
                        return Some(view);
                    }
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .ok()
            .flatten()
    }
}

fn newest_ticks(view: &ViewModel) -> Option<MessageStatus> {
    view.ordered_messages.first().and_then(|row| row.ticks)
}

fn show(step: &str, view: Option<ViewModel>) {
    match view {
        Some(view) => println!("\n== {step} ==\n{}", render_screen(&view)),
        None => println!("\n== {step} == (timed out)"),
    }
}

async fn run_demo(settings: ChatSettings) {
    let hub = MemoryHub::new();
    let (Some(mut amina), Some(mut bashir)) = (
        DemoParticipant::start(&hub, settings.clone()),
        DemoParticipant::start(&hub, settings),
    ) else {
        return;
    };

    amina
        .send(ChatCommand::Join {
            display_name: "Amina".into(),
            contact_id: "0711000111".into(),
        })
        .await;
    amina
        .send(ChatCommand::SelectPartner {
            contact_id: "0722000222".into(),
        })
        .await;
    amina
        .send(ChatCommand::SendMessage("Karibu! Are you coming to the baraza?".into()))
        .await;
    let view = amina
        .wait_for(|view| newest_ticks(view) == Some(MessageStatus::Sent))
        .await;
    show("Amina sends while Bashir is away", view);

    bashir
        .send(ChatCommand::Join {
            display_name: "Bashir".into(),
            contact_id: "0722000222".into(),
        })
        .await;
    let view = amina
        .wait_for(|view| newest_ticks(view) == Some(MessageStatus::Delivered))
        .await;
    show("Bashir comes online", view);

    bashir
        .send(ChatCommand::SelectPartner {
            contact_id: "0711000111".into(),
        })
        .await;
    let view = bashir
        .wait_for(|view| !view.loading && !view.ordered_messages.is_empty())
        .await;
    show("Bashir opens the conversation", view);

    let view = amina
        .wait_for(|view| newest_ticks(view) == Some(MessageStatus::Read))
        .await;
    show("Amina sees it was read", view);
}
