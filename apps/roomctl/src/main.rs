use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use room_sync::{RoomSync, StaticSession, SyncConfig, SyncEvent};
use shared::{
    domain::{MessageId, RoomId},
    protocol::Message,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Inspect and post to chat rooms")]
struct Cli {
    #[arg(long, default_value = room_sync::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides the API base URL from the config file and environment.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long, env = "ROOM_SYNC_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long)]
    page_size: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the newest pages of a room's history.
    History {
        room: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Print history, then follow the live channel until interrupted.
    Tail { room: String },
    /// Post one message and wait for the server to confirm it.
    Send { room: String, content: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut config = SyncConfig::load_from(&cli.config);
    if let Some(url) = cli.api_url {
        config = config.with_api_base_url(url);
    }
    if let Some(page_size) = cli.page_size {
        config = config.with_page_size(page_size);
    }
    info!(api = %config.api_base_url, page_size = config.page_size, "roomctl: starting");

    let session = Arc::new(
        StaticSession::new(cli.token).on_invalidate(|| warn!("roomctl: token was rejected")),
    );
    let sync = RoomSync::new(config, session);

    match cli.command {
        Command::History { room, pages } => history(&sync, RoomId::new(room), pages).await?,
        Command::Tail { room } => tail(&sync, RoomId::new(room)).await?,
        Command::Send { room, content } => send(&sync, RoomId::new(room), &content).await?,
    }

    sync.leave_room().await;
    Ok(())
}

async fn history(sync: &Arc<RoomSync>, room: RoomId, pages: u32) -> Result<()> {
    sync.enter_room(room.clone())
        .await
        .with_context(|| format!("failed to open room {room}"))?;

    for _ in 1..pages {
        if sync.load_older().await?.is_none() {
            break;
        }
    }

    let snapshot = sync.snapshot().await;
    for message in &snapshot {
        print_message(message);
    }
    if !sync.has_more().await {
        println!("-- start of {room} ({} messages)", snapshot.len());
    }
    Ok(())
}

async fn tail(sync: &Arc<RoomSync>, room: RoomId) -> Result<()> {
    let mut events = sync.subscribe_events();
    sync.enter_room(room.clone())
        .await
        .with_context(|| format!("failed to open room {room}"))?;

    let mut printed = HashSet::new();
    print_new(sync, &mut printed).await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("roomctl: interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SyncEvent::TimelineChanged { .. }) => print_new(sync, &mut printed).await,
                Ok(SyncEvent::ConnectionStateChanged { state, .. }) if state.is_terminal() => {
                    println!("-- live channel {state}");
                    return Ok(());
                }
                Ok(SyncEvent::ConnectionStateChanged { .. }) => {}
                Ok(SyncEvent::SessionInvalidated) => bail!("session invalidated; get a new token"),
                Ok(SyncEvent::Error(text)) => warn!("roomctl: {text}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "roomctl: event stream lagged");
                    print_new(sync, &mut printed).await;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn send(sync: &Arc<RoomSync>, room: RoomId, content: &str) -> Result<()> {
    sync.enter_room(room.clone())
        .await
        .with_context(|| format!("failed to open room {room}"))?;

    let handle = sync.send(content).await?;
    let confirmed = handle.settled().await.context("send failed")?;
    println!("sent {} at {}", confirmed.id, confirmed.created_at.to_rfc3339());
    Ok(())
}

async fn print_new(sync: &RoomSync, printed: &mut HashSet<MessageId>) {
    for message in sync.snapshot().await {
        if !message.pending && printed.insert(message.id.clone()) {
            print_message(&message);
        }
    }
}

fn print_message(message: &Message) {
    let marker = if message.pending { " (sending)" } else { "" };
    println!(
        "[{}] {}: {}{marker}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id,
        message.content
    );
}
