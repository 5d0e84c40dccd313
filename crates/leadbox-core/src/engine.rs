//! Ingest engine for transport events and user actions

use crate::config::EngineConfig;
use crate::conversation::ConversationKey;
use crate::folder::FolderCounts;
use crate::ingest::{AggregateState, IngestOutcome};
use crate::models::{Folder, InboundEvent, MessageStatus, UserId};
use crate::status::Mutation;
use crate::thread::RebuildReport;
use crate::{CoreResult, Inbox};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Commands sent from the transport boundary or the UI to the engine
#[derive(Debug, Clone)]
pub enum IngestCommand {
    /// Ingest an event delivered by the mail transport
    Deliver(InboundEvent),
    /// Mark message as read
    MarkRead { user_id: UserId, message_id: String },
    /// Mark message as unread
    MarkUnread { user_id: UserId, message_id: String },
    /// Move message to another folder
    MoveToFolder {
        user_id: UserId,
        message_id: String,
        folder: Folder,
    },
    /// Recompute every thread of a user
    RebuildThreads { user_id: UserId },
    /// Stop the engine once in-flight commands finish
    Shutdown,
}

/// Events sent from the engine to its observers
#[derive(Debug, Clone)]
pub enum IngestEvent {
    /// A new message was stored
    MessageStored {
        user_id: UserId,
        message_id: String,
        conversation_key: ConversationKey,
    },
    /// The transport redelivered an already stored message
    DuplicateIgnored { user_id: UserId, message_id: String },
    /// An event was not stored
    EventDropped {
        message_id: String,
        reason: String,
        /// Whether the transport should deliver it again
        retryable: bool,
    },
    /// Thread summary recomputed
    ThreadUpdated {
        user_id: UserId,
        conversation_key: ConversationKey,
        message_count: i64,
        unread_count: i64,
    },
    /// Thread could not be recomputed and will stay stale until a rebuild
    ThreadStale {
        user_id: UserId,
        conversation_key: ConversationKey,
        error: String,
    },
    /// Message status or folder changed
    StatusChanged {
        user_id: UserId,
        message_id: String,
        status: MessageStatus,
        folder: Folder,
    },
    /// Unread badges changed for a user
    UnreadCountsChanged { user_id: UserId, counts: FolderCounts },
    /// Reconciliation finished
    ThreadsRebuilt { user_id: UserId, report: RebuildReport },
    /// Error occurred
    Error { message: String },
}

/// Engine that runs commands concurrently in background tokio tasks
pub struct IngestEngine {
    inbox: Arc<Inbox>,
    command_rx: mpsc::Receiver<IngestCommand>,
    event_tx: mpsc::Sender<IngestEvent>,
    permits: Arc<Semaphore>,
}

impl IngestEngine {
    /// Create a new ingest engine
    pub fn new(
        inbox: Arc<Inbox>,
        config: &EngineConfig,
        command_rx: mpsc::Receiver<IngestCommand>,
        event_tx: mpsc::Sender<IngestEvent>,
    ) -> Self {
        Self {
            inbox,
            command_rx,
            event_tx,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
        }
    }

    /// Run the engine until `Shutdown` or until every command sender is dropped
    pub async fn run(mut self) {
        info!("Ingest engine started");
        let mut tasks = JoinSet::new();

        while let Some(command) = self.command_rx.recv().await {
            if let IngestCommand::Shutdown = command {
                info!("Ingest engine shutting down");
                break;
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let inbox = self.inbox.clone();
            let event_tx = self.event_tx.clone();

            tasks.spawn(async move {
                if let Err(e) = handle_command(&inbox, &event_tx, command).await {
                    error!("Error handling ingest command: {}", e);
                    let _ = event_tx
                        .send(IngestEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
                drop(permit);
            });

            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!("Ingest task panicked: {}", e);
                }
            }
        }

        debug!("Waiting for {} in-flight commands", tasks.len());
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Ingest task panicked: {}", e);
            }
        }

        info!("Ingest engine stopped");
    }
}

/// Handle an ingest command
async fn handle_command(
    inbox: &Inbox,
    events: &mpsc::Sender<IngestEvent>,
    command: IngestCommand,
) -> CoreResult<()> {
    match command {
        IngestCommand::Deliver(event) => {
            deliver(inbox, events, event).await;
        }
        IngestCommand::MarkRead {
            user_id,
            message_id,
        } => {
            let mutation = inbox.mark_read(&message_id, &user_id).await?;
            report_mutation(inbox, events, mutation).await;
        }
        IngestCommand::MarkUnread {
            user_id,
            message_id,
        } => {
            let mutation = inbox.mark_unread(&message_id, &user_id).await?;
            report_mutation(inbox, events, mutation).await;
        }
        IngestCommand::MoveToFolder {
            user_id,
            message_id,
            folder,
        } => {
            let mutation = inbox.move_to_folder(&message_id, &user_id, folder).await?;
            report_mutation(inbox, events, mutation).await;
        }
        IngestCommand::RebuildThreads { user_id } => {
            let report = inbox.rebuild_threads(&user_id).await?;
            let _ = events
                .send(IngestEvent::ThreadsRebuilt {
                    user_id: user_id.clone(),
                    report,
                })
                .await;
            report_counts(inbox, events, &user_id).await;
        }
        // Consumed by the run loop
        IngestCommand::Shutdown => {}
    }

    Ok(())
}

/// Ingest one event; failures are terminal for this event only
async fn deliver(inbox: &Inbox, events: &mpsc::Sender<IngestEvent>, event: InboundEvent) {
    let outcome = match inbox.receive(&event).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let retryable = e.is_retryable();
            if retryable {
                warn!("Event {} failed, transport should retry: {}", event.message_id, e);
            }
            let _ = events
                .send(IngestEvent::EventDropped {
                    message_id: event.message_id,
                    reason: e.to_string(),
                    retryable,
                })
                .await;
            return;
        }
    };

    let IngestOutcome {
        message,
        duplicate,
        aggregate,
    } = outcome;

    if duplicate {
        let _ = events
            .send(IngestEvent::DuplicateIgnored {
                user_id: message.user_id,
                message_id: message.message_id,
            })
            .await;
        return;
    }

    let _ = events
        .send(IngestEvent::MessageStored {
            user_id: message.user_id.clone(),
            message_id: message.message_id.clone(),
            conversation_key: message.conversation_key.clone(),
        })
        .await;
    report_aggregate(events, &message.user_id, &message.conversation_key, aggregate).await;
    report_counts(inbox, events, &message.user_id).await;
}

async fn report_mutation(inbox: &Inbox, events: &mpsc::Sender<IngestEvent>, mutation: Mutation) {
    let Mutation {
        message,
        changed,
        aggregate,
    } = mutation;
    if !changed {
        return;
    }

    let _ = events
        .send(IngestEvent::StatusChanged {
            user_id: message.user_id.clone(),
            message_id: message.message_id.clone(),
            status: message.status,
            folder: message.folder.clone(),
        })
        .await;
    report_aggregate(events, &message.user_id, &message.conversation_key, aggregate).await;
    report_counts(inbox, events, &message.user_id).await;
}

async fn report_aggregate(
    events: &mpsc::Sender<IngestEvent>,
    user_id: &UserId,
    key: &ConversationKey,
    aggregate: AggregateState,
) {
    let event = match aggregate {
        AggregateState::Updated(thread) => IngestEvent::ThreadUpdated {
            user_id: user_id.clone(),
            conversation_key: key.clone(),
            message_count: thread.message_count,
            unread_count: thread.unread_count,
        },
        AggregateState::Stale(error) => IngestEvent::ThreadStale {
            user_id: user_id.clone(),
            conversation_key: key.clone(),
            error,
        },
        AggregateState::Skipped => return,
    };
    let _ = events.send(event).await;
}

async fn report_counts(inbox: &Inbox, events: &mpsc::Sender<IngestEvent>, user_id: &UserId) {
    let counts = inbox.badges(user_id).await;
    let _ = events
        .send(IngestEvent::UnreadCountsChanged {
            user_id: user_id.clone(),
            counts,
        })
        .await;
}

/// Create ingest engine channels
/// Returns (command_sender, command_receiver, event_sender, event_receiver)
pub fn create_ingest_channels(
    buffer: usize,
) -> (
    mpsc::Sender<IngestCommand>,
    mpsc::Receiver<IngestCommand>,
    mpsc::Sender<IngestEvent>,
    mpsc::Receiver<IngestEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<IngestCommand>(buffer);
    let (evt_tx, evt_rx) = mpsc::channel::<IngestEvent>(buffer);
    (cmd_tx, cmd_rx, evt_tx, evt_rx)
}
