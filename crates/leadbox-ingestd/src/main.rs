//! Leadbox ingestion daemon
//!
//! Reads transport events as newline-delimited JSON on stdin and feeds them
//! to the ingest engine. Subcommands expose the read side for scripting.
//!
//! Usage:
//!   leadbox-ingestd < events.ndjson       # Ingest events until EOF
//!   leadbox-ingestd badges <user>         # Print unread counts per folder
//!   leadbox-ingestd threads <user>        # Print the thread list
//!   leadbox-ingestd rebuild <user>        # Recompute every thread of a user

use anyhow::Context;
use clap::{Parser, Subcommand};
use leadbox_core::models::{InboundEvent, UserId};
use leadbox_core::{
    create_ingest_channels, Database, EngineConfig, Inbox, IngestCommand, IngestEngine,
    IngestEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "leadbox-ingestd", about = "Leadbox inbound email ingestion")]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "LEADBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print unread counts per folder
    Badges { user: String },
    /// Print a user's threads, most recent first
    Threads { user: String },
    /// Recompute every thread of a user from its messages
    Rebuild { user: String },
}

/// Totals reported when stdin is exhausted
#[derive(Debug, Default)]
struct Tally {
    stored: usize,
    duplicates: usize,
    dropped: usize,
    retryable: usize,
    stale: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("leadbox=debug".parse()?))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let inbox = Arc::new(Inbox::new(Arc::new(db), &config));

    match cli.command {
        Some(Command::Badges { user }) => {
            let counts = inbox.unread_by_folder(&UserId::new(user)).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Some(Command::Threads { user }) => {
            let threads = inbox.list_threads(&UserId::new(user)).await?;
            println!("{}", serde_json::to_string_pretty(&threads)?);
        }
        Some(Command::Rebuild { user }) => {
            let report = inbox.rebuild_threads(&UserId::new(user)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => ingest_stdin(inbox, &config).await?,
    }

    Ok(())
}

async fn ingest_stdin(inbox: Arc<Inbox>, config: &EngineConfig) -> anyhow::Result<()> {
    info!("Starting Leadbox ingestion");

    let (cmd_tx, cmd_rx, evt_tx, evt_rx) = create_ingest_channels(config.command_buffer);
    let engine = tokio::spawn(IngestEngine::new(inbox, config, cmd_rx, evt_tx).run());
    let observer = tokio::spawn(observe(evt_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: InboundEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping line {}: not an inbound event: {}", line_no, e);
                continue;
            }
        };

        if cmd_tx.send(IngestCommand::Deliver(event)).await.is_err() {
            error!("Ingest engine stopped before input was exhausted");
            break;
        }
    }

    debug!("End of input after {} lines", line_no);
    let _ = cmd_tx.send(IngestCommand::Shutdown).await;
    engine.await.context("ingest engine task")?;

    let tally = observer.await.context("event observer task")?;
    info!(
        "Ingestion finished: {} stored, {} duplicates, {} dropped ({} retryable), {} stale threads",
        tally.stored, tally.duplicates, tally.dropped, tally.retryable, tally.stale
    );

    if tally.retryable > 0 {
        anyhow::bail!("{} events failed and should be redelivered", tally.retryable);
    }
    Ok(())
}

/// Log engine events until the engine drops its sender
async fn observe(mut events: mpsc::Receiver<IngestEvent>) -> Tally {
    let mut tally = Tally::default();

    while let Some(event) = events.recv().await {
        match event {
            IngestEvent::MessageStored {
                user_id,
                message_id,
                conversation_key,
            } => {
                tally.stored += 1;
                info!("Stored {} for {} in {}", message_id, user_id, conversation_key);
            }
            IngestEvent::DuplicateIgnored {
                user_id,
                message_id,
            } => {
                tally.duplicates += 1;
                debug!("Duplicate {} for {}", message_id, user_id);
            }
            IngestEvent::EventDropped {
                message_id,
                reason,
                retryable,
            } => {
                tally.dropped += 1;
                if retryable {
                    tally.retryable += 1;
                }
                warn!("Dropped {}: {}", message_id, reason);
            }
            IngestEvent::ThreadUpdated {
                conversation_key,
                message_count,
                unread_count,
                ..
            } => {
                debug!(
                    "Thread {}: {} messages, {} unread",
                    conversation_key, message_count, unread_count
                );
            }
            IngestEvent::ThreadStale {
                conversation_key,
                error,
                ..
            } => {
                tally.stale += 1;
                warn!("Thread {} is stale: {}", conversation_key, error);
            }
            IngestEvent::StatusChanged {
                message_id,
                status,
                folder,
                ..
            } => {
                debug!("Message {} is {} in {}", message_id, status.as_str(), folder);
            }
            IngestEvent::UnreadCountsChanged { user_id, counts } => {
                debug!("Unread counts for {}: {:?}", user_id, counts);
            }
            IngestEvent::ThreadsRebuilt { user_id, report } => {
                info!("Rebuilt threads for {}: {:?}", user_id, report);
            }
            IngestEvent::Error { message } => {
                error!("Ingest error: {}", message);
            }
        }
    }

    tally
}
