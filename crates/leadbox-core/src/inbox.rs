//! Inbox service wiring the components together
//!
//! Flow for a transport event: validate, resolve identities, derive the
//! conversation key, store the message, recompute the thread. Folder counts
//! are derived on demand and never stored.

use crate::config::EngineConfig;
use crate::conversation::ConversationKey;
use crate::folder::{FolderCounter, FolderCounts};
use crate::identity::IdentityResolver;
use crate::ingest::{resolved_message, IngestOutcome, MessageIngestor};
use crate::models::{Folder, InboundEvent, Message, Thread, UserId};
use crate::status::{Mutation, StatusMutator};
use crate::storage::Storage;
use crate::thread::{RebuildReport, ThreadAggregator};
use crate::{CoreError, CoreResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for everything the transport and the UI ask of the core
pub struct Inbox {
    storage: Arc<dyn Storage>,
    resolver: IdentityResolver,
    aggregator: Arc<ThreadAggregator>,
    ingestor: MessageIngestor,
    counter: FolderCounter,
    mutator: StatusMutator,
}

impl Inbox {
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        let aggregator = Arc::new(ThreadAggregator::new(storage.clone(), config));
        Self {
            resolver: IdentityResolver::new(storage.clone()),
            ingestor: MessageIngestor::new(storage.clone(), aggregator.clone()),
            counter: FolderCounter::new(storage.clone()),
            mutator: StatusMutator::new(storage.clone(), aggregator.clone()),
            aggregator,
            storage,
        }
    }

    /// Ingest one transport event.
    ///
    /// Events that cannot be attributed to a campaign sender are dropped
    /// with a warning and nothing is stored.
    pub async fn receive(&self, event: &InboundEvent) -> CoreResult<IngestOutcome> {
        event.validate()?;
        debug!("Received event {} ({} -> {})", event.message_id, event.from, event.to);

        let resolution = match self.resolver.resolve(&event.from, &event.to).await {
            Ok(resolution) => resolution,
            Err(e @ CoreError::UnresolvedSender { .. }) => {
                warn!("Dropping event {}: {}", event.message_id, e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let message = resolved_message(event, &resolution);
        self.ingestor.ingest(&message).await
    }

    pub async fn mark_read(&self, message_id: &str, user: &UserId) -> CoreResult<Mutation> {
        self.mutator.mark_read(message_id, user).await
    }

    pub async fn mark_unread(&self, message_id: &str, user: &UserId) -> CoreResult<Mutation> {
        self.mutator.mark_unread(message_id, user).await
    }

    pub async fn move_to_folder(
        &self,
        message_id: &str,
        user: &UserId,
        folder: Folder,
    ) -> CoreResult<Mutation> {
        self.mutator.move_to_folder(message_id, user, folder).await
    }

    pub async fn archive(&self, message_id: &str, user: &UserId) -> CoreResult<Mutation> {
        self.mutator.archive(message_id, user).await
    }

    /// Force a recompute of one thread
    pub async fn refresh_thread(&self, key: &ConversationKey, user: &UserId) -> CoreResult<Thread> {
        self.aggregator.upsert(key, user).await
    }

    pub async fn rebuild_threads(&self, user: &UserId) -> CoreResult<RebuildReport> {
        self.aggregator.rebuild_all(user).await
    }

    pub async fn unread_by_folder(&self, user: &UserId) -> CoreResult<FolderCounts> {
        self.counter.unread_by_folder(user).await
    }

    /// Unread badges, empty when counts are unavailable
    pub async fn badges(&self, user: &UserId) -> FolderCounts {
        self.counter.badges(user).await
    }

    pub async fn list_threads(&self, user: &UserId) -> CoreResult<Vec<Thread>> {
        self.storage.list_threads(user).await
    }

    /// Thread list for display, empty when storage is unavailable
    pub async fn thread_view(&self, user: &UserId) -> Vec<Thread> {
        match self.list_threads(user).await {
            Ok(threads) => threads,
            Err(e) => {
                warn!("Thread list unavailable for user {}: {}", user, e);
                Vec::new()
            }
        }
    }

    /// Messages of one conversation, oldest first
    pub async fn conversation_messages(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<Vec<Message>> {
        self.storage.conversation_messages(user, key).await
    }
}
