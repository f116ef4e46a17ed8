/// ChatLink terminal client - Main entry point
use chatlink_core::history::NoopAnchor;
use chatlink_core::{ChatClient, ChatMessage, Config, OutgoingMessage, SessionEvent};
use colored::Colorize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (config, session) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting ChatLink client");
    info!("   Server: {}", config.server_url);
    info!("   Room: {}", session);

    let client = ChatClient::from_config(config)
        .map_err(|e| anyhow::anyhow!("Client error: {}", e))?;

    client.manager().on_message(&session, |event| {
        if let SessionEvent::Message { message } = event {
            print_message(message);
        }
    });
    client.manager().on_state_change(&session, |event| {
        if let SessionEvent::Failed { reason } = event {
            eprintln!("{} {}", "✗ Disconnected:".red().bold(), reason);
        }
    });

    let room = client
        .open_room(&session, Arc::new(NoopAnchor))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open room {}: {}", session, e))?;
    for message in room.snapshot() {
        print_message(&message);
    }

    match client.manager().wait_open(&session, Duration::from_secs(30)).await {
        Ok(()) => println!("{}", "✓ Connected. Type to chat, /older for history, /quit to leave.".green()),
        Err(e) => eprintln!("{} {}", "✗ Not connected yet:".yellow(), e),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/older" => match room.load_older().await {
                Ok(Some(hint)) => {
                    println!("{}", "── older messages ──".dimmed());
                    for message in room.snapshot() {
                        if message.id == hint.anchor_message_id {
                            break;
                        }
                        print_message(&message);
                    }
                }
                Ok(None) => println!("{}", "No more messages".dimmed()),
                Err(e) => eprintln!("{} {}", "✗ History:".red(), e),
            },
            "/reconnect" => client.manager().reconnect(&session),
            text => {
                if let Err(e) = client.send(&session, OutgoingMessage::text(text)) {
                    eprintln!("{} {}", "✗ Not sent:".red(), e);
                }
            }
        }
    }

    client.logout();
    info!("Client stopped");
    Ok(())
}

fn print_message(message: &ChatMessage) {
    println!(
        "{} {} {}",
        message.timestamp.format("%H:%M:%S").to_string().dimmed(),
        format!("<{}>", message.author_id).bold(),
        message.content
    );
}
