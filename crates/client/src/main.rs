//! nobody-call
//!
//! Headless command-line client for nobody-chat calls.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use client::config::Config;
use client::{CallClient, ChannelPresenter, PresenterEvent};
use tracing_subscriber::EnvFilter;

/// nobody-call - encrypted relay signaling and one-to-one calls.
#[derive(Parser, Debug)]
#[command(name = "nobody-call")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect to the relay and wait for calls
    Connect,

    /// Connect to the relay and call a peer
    Call {
        /// Relay-assigned id of the peer
        peer_id: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    let overrides = config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.client.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for name in overrides {
        tracing::info!(variable = name, "Configuration overridden from environment");
    }

    config.validate()?;

    match cli.command {
        Commands::Connect => run(&config, None).await,
        Commands::Call { peer_id } => run(&config, Some(peer_id)).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: &Config, peer_id: Option<String>) -> anyhow::Result<()> {
    let (presenter, mut events) = ChannelPresenter::new();
    let client = CallClient::connect(config, Arc::new(presenter)).await?;

    println!("Connected as {} (id {})", client.local_name(), client.local_id());

    if let Some(peer_id) = peer_id {
        println!("Calling {peer_id}...");
        client.call(peer_id);
    }

    let auto_accept = config.call.auto_accept;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = client.closed() => {
                println!("Relay connection closed");
                break;
            }
            event = events.recv() => match event {
                Some(event) => handle_event(&client, event, auto_accept),
                None => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

fn handle_event(client: &CallClient, event: PresenterEvent, auto_accept: bool) {
    match event {
        PresenterEvent::StateChanged { state, peer_id } => match peer_id {
            Some(peer) => println!("[{state}] with {peer}"),
            None => println!("[{state}]"),
        },
        PresenterEvent::ConsentRequested { peer_id } => {
            if auto_accept {
                println!("Accepting call from {peer_id}");
                client.accept();
            } else {
                println!("Declining call from {peer_id} (auto_accept is off)");
                client.deny();
            }
        }
        PresenterEvent::Notification(notification) => println!("{notification}"),
        PresenterEvent::RemoteTrack { peer_id, kind } => {
            println!("Receiving {kind} from {peer_id}");
        }
        PresenterEvent::Chat { from, text } => println!("<{from}> {text}"),
        PresenterEvent::Roster(contacts) => {
            println!("Online: {}", format_roster(&contacts));
        }
    }
}

fn format_roster(contacts: &[client::Contact]) -> String {
    if contacts.is_empty() {
        return "nobody".to_string();
    }
    contacts
        .iter()
        .map(|c| format!("{} ({})", c.name, c.id))
        .collect::<Vec<_>>()
        .join(", ")
}
