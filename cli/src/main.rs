//! Huddle CLI client - terminal chat for issue rooms

mod client;
mod messages;
mod tui;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::{HuddleClient, User};
use crate::messages::ServerEvent;

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "CLI client for huddle - real-time issue collaboration")]
#[command(version)]
struct Cli {
    /// Server URL (default: ws://localhost:3000/ws)
    #[arg(short, long, default_value = "ws://localhost:3000/ws")]
    server: String,

    /// Your user id, as known to the marketplace
    #[arg(short, long, env = "HUDDLE_USER")]
    user: String,

    /// Your display name
    #[arg(short = 'n', long, default_value = "CLI User")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join an issue room and start the interactive TUI
    Chat {
        /// Issue id of the room
        #[arg(short, long)]
        room: String,
    },

    /// Send one message to a room (non-interactive)
    Send {
        #[arg(short, long)]
        room: String,

        /// Message content
        #[arg(short, long)]
        message: String,
    },

    /// Print room events as they arrive
    Watch {
        #[arg(short, long)]
        room: String,

        /// Exit after this many chat messages
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let user = User {
        id: cli.user,
        name: cli.name,
    };

    match cli.command {
        Commands::Chat { room } => {
            let client = HuddleClient::connect(&cli.server, user).await?;
            tui::run(client, &room).await
        }
        Commands::Send { room, message } => run_send(&cli.server, user, &room, message).await,
        Commands::Watch { room, count } => run_watch(&cli.server, user, &room, count).await,
    }
}

async fn run_send(server: &str, user: User, room: &str, message: String) -> Result<()> {
    let mut client = HuddleClient::connect(server, user).await?;
    client.join(room).await?;
    client.send_message(room, message).await?;

    // Wait for the server's verdict on our own message
    while let Some(event) = client.recv().await {
        match event {
            ServerEvent::ReceiveMessage(m) if m.sender.id == client.user().id => {
                println!("Sent {}", m.id);
                return Ok(());
            }
            ServerEvent::MessageFlagged(f) => {
                return Err(anyhow!("Message blocked: {}", f.reason));
            }
            ServerEvent::MessageFailed(f) => {
                return Err(anyhow!("Message not stored: {}", f.reason));
            }
            ServerEvent::Error(e) => {
                return Err(anyhow!("Server error ({}): {}", e.code, e.message));
            }
            _ => continue,
        }
    }

    Err(anyhow!("Connection closed"))
}

async fn run_watch(server: &str, user: User, room: &str, count: Option<usize>) -> Result<()> {
    let mut client = HuddleClient::connect(server, user).await?;
    let participants = client.join(room).await?;

    println!("Watching {} ({} connected)", room, participants.len());
    println!("{:─<60}", "");

    let mut seen = 0;
    client
        .listen(|event| {
            match event {
                ServerEvent::ReceiveMessage(m) => {
                    println!(
                        "[{}] {}: {}",
                        m.created_at.format("%H:%M:%S"),
                        m.sender.name,
                        m.content
                    );
                    seen += 1;
                    if count.is_some_and(|limit| seen >= limit) {
                        return false; // Stop listening
                    }
                }
                ServerEvent::MessageDeleted(id) => println!("  (message {} deleted)", id),
                ServerEvent::UserTyping(t) => tracing::debug!("{} is typing", t.user_id),
                ServerEvent::CodeSnippetCreated(s) => {
                    println!("  {} started a {} snippet", s.created_by, s.language)
                }
                ServerEvent::Error(e) => eprintln!("error ({}): {}", e.code, e.message),
                other => tracing::debug!("{:?}", other),
            }
            true // Continue listening
        })
        .await
}
