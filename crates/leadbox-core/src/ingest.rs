//! Message ingestion

use crate::conversation::ConversationKey;
use crate::identity::Resolution;
use crate::models::{InboundEvent, Message, NewMessage, Thread};
use crate::storage::{MessageInsert, Storage};
use crate::thread::ThreadAggregator;
use crate::CoreResult;
use std::sync::Arc;
use tracing::{info, warn};

/// What happened to the thread summary after an ingestion
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateState {
    /// Thread recomputed and stored
    Updated(Thread),
    /// Duplicate delivery, thread left untouched
    Skipped,
    /// Message stored but the thread could not be recomputed; `rebuild_all` heals it
    Stale(String),
}

/// Result of ingesting one message
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    /// Stored message (the pre-existing one for duplicates)
    pub message: Message,
    /// The transport redelivered a message that was already stored
    pub duplicate: bool,
    pub aggregate: AggregateState,
}

impl IngestOutcome {
    pub fn thread(&self) -> Option<&Thread> {
        match &self.aggregate {
            AggregateState::Updated(thread) => Some(thread),
            _ => None,
        }
    }
}

/// Build the message to store from a transport event and its resolution
pub fn resolved_message(event: &InboundEvent, resolution: &Resolution) -> NewMessage {
    let sent_at = event.sent_at();
    if sent_at.is_none() && event.has_date() {
        warn!(
            "Unparseable date {:?} on message {}",
            event.date, event.message_id
        );
    }

    NewMessage {
        user_id: resolution.user_id.clone(),
        message_id: event.message_id.trim().to_string(),
        conversation_key: ConversationKey::derive(
            &resolution.contact_email,
            &resolution.sender.email,
        ),
        campaign_id: Some(resolution.sender.campaign_id.clone()),
        direction: resolution.direction,
        folder: None,
        status: None,
        subject: event.subject.clone(),
        body_text: event.text_body.clone(),
        body_html: event.html_body.clone().filter(|html| !html.trim().is_empty()),
        sender_email: resolution.sender.email.clone(),
        contact_email: resolution.contact_email.clone(),
        contact_name: resolution
            .contact
            .as_ref()
            .and_then(|c| c.display_name.clone()),
        provider_thread_id: event.thread_id.clone(),
        sent_at,
        has_attachments: event.has_attachments,
    }
}

/// Persists messages exactly once and triggers thread aggregation
pub struct MessageIngestor {
    storage: Arc<dyn Storage>,
    aggregator: Arc<ThreadAggregator>,
}

impl MessageIngestor {
    pub fn new(storage: Arc<dyn Storage>, aggregator: Arc<ThreadAggregator>) -> Self {
        Self {
            storage,
            aggregator,
        }
    }

    /// Store a resolved message.
    ///
    /// Redelivery of a stored (user, message id) returns the existing row.
    /// Storage failures are returned to the caller without retrying; an
    /// aggregation failure after a successful insert leaves the message in
    /// place and reports the thread as stale.
    pub async fn ingest(&self, message: &NewMessage) -> CoreResult<IngestOutcome> {
        let stored = match self.storage.insert_message_if_absent(message).await? {
            MessageInsert::Existing(existing) => {
                info!(
                    "Message {} already stored for user {}, ignoring redelivery",
                    existing.message_id, existing.user_id
                );
                return Ok(IngestOutcome {
                    message: existing,
                    duplicate: true,
                    aggregate: AggregateState::Skipped,
                });
            }
            MessageInsert::Inserted(stored) => stored,
        };

        info!(
            "Stored {} message {} for user {} in {}",
            stored.direction.as_str(),
            stored.message_id,
            stored.user_id,
            stored.folder
        );

        let aggregate = match self
            .aggregator
            .upsert(&stored.conversation_key, &stored.user_id)
            .await
        {
            Ok(thread) => AggregateState::Updated(thread),
            Err(e) => {
                warn!(
                    "Thread {} is stale after storing {}: {}",
                    stored.conversation_key, stored.message_id, e
                );
                AggregateState::Stale(e.to_string())
            }
        };

        Ok(IngestOutcome {
            message: stored,
            duplicate: false,
            aggregate,
        })
    }
}
