//! Read/unread transitions and folder moves
//!
//! Every successful change is followed by a thread recompute so that the
//! owning thread's unread count reflects the new state immediately.

use crate::ingest::AggregateState;
use crate::models::{Folder, Message, MessageStatus, UserId};
use crate::storage::Storage;
use crate::thread::ThreadAggregator;
use crate::{CoreError, CoreResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a status or folder change
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub message: Message,
    /// False when the message was already in the requested state
    pub changed: bool,
    pub aggregate: AggregateState,
}

/// Applies user-driven changes to a single message
pub struct StatusMutator {
    storage: Arc<dyn Storage>,
    aggregator: Arc<ThreadAggregator>,
}

impl StatusMutator {
    pub fn new(storage: Arc<dyn Storage>, aggregator: Arc<ThreadAggregator>) -> Self {
        Self {
            storage,
            aggregator,
        }
    }

    pub async fn mark_read(&self, message_id: &str, user: &UserId) -> CoreResult<Mutation> {
        self.set_status(message_id, user, MessageStatus::Read).await
    }

    pub async fn mark_unread(&self, message_id: &str, user: &UserId) -> CoreResult<Mutation> {
        self.set_status(message_id, user, MessageStatus::Unread)
            .await
    }

    /// Move a message to the archive folder
    pub async fn archive(&self, message_id: &str, user: &UserId) -> CoreResult<Mutation> {
        self.move_to_folder(message_id, user, Folder::Archived)
            .await
    }

    /// Transition a message's status.
    ///
    /// Messages owned by another user are reported as not found.
    pub async fn set_status(
        &self,
        message_id: &str,
        user: &UserId,
        status: MessageStatus,
    ) -> CoreResult<Mutation> {
        let current = self.owned(message_id, user).await?;
        if current.status == status {
            debug!("Message {} already {}", message_id, status.as_str());
            return Ok(Mutation {
                message: current,
                changed: false,
                aggregate: AggregateState::Skipped,
            });
        }

        let updated = self
            .storage
            .set_message_status(user, message_id, status)
            .await?
            .ok_or_else(|| CoreError::MessageNotFound(message_id.to_string()))?;

        info!("Message {} marked {}", message_id, status.as_str());
        Ok(self.propagate(updated).await)
    }

    /// Move a message to another folder
    pub async fn move_to_folder(
        &self,
        message_id: &str,
        user: &UserId,
        folder: Folder,
    ) -> CoreResult<Mutation> {
        let current = self.owned(message_id, user).await?;
        if current.folder == folder {
            debug!("Message {} already in {}", message_id, folder);
            return Ok(Mutation {
                message: current,
                changed: false,
                aggregate: AggregateState::Skipped,
            });
        }

        let updated = self
            .storage
            .set_message_folder(user, message_id, &folder)
            .await?
            .ok_or_else(|| CoreError::MessageNotFound(message_id.to_string()))?;

        info!("Message {} moved {} -> {}", message_id, current.folder, folder);
        Ok(self.propagate(updated).await)
    }

    async fn owned(&self, message_id: &str, user: &UserId) -> CoreResult<Message> {
        self.storage
            .get_message(user, message_id)
            .await?
            .ok_or_else(|| CoreError::MessageNotFound(message_id.to_string()))
    }

    async fn propagate(&self, message: Message) -> Mutation {
        let aggregate = match self
            .aggregator
            .upsert(&message.conversation_key, &message.user_id)
            .await
        {
            Ok(thread) => AggregateState::Updated(thread),
            Err(e) => {
                warn!(
                    "Thread {} is stale after changing {}: {}",
                    message.conversation_key, message.message_id, e
                );
                AggregateState::Stale(e.to_string())
            }
        };

        Mutation {
            message,
            changed: true,
            aggregate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::conversation::ConversationKey;
    use crate::models::{Direction, NewMessage};
    use crate::Database;

    async fn setup() -> (Arc<Database>, StatusMutator) {
        let db = Arc::new(Database::open_memory().await.unwrap());
        let aggregator = Arc::new(ThreadAggregator::new(db.clone(), &EngineConfig::default()));

        let msg = NewMessage {
            user_id: UserId::from("u1"),
            message_id: "m1".into(),
            conversation_key: ConversationKey::derive("p@example.com", "s@acme.com"),
            campaign_id: None,
            direction: Direction::Inbound,
            folder: None,
            status: None,
            subject: "Hi".into(),
            body_text: "Hello".into(),
            body_html: None,
            sender_email: "s@acme.com".into(),
            contact_email: "p@example.com".into(),
            contact_name: None,
            provider_thread_id: None,
            sent_at: None,
            has_attachments: false,
        };
        db.insert_message_if_absent(&msg).await.unwrap();
        aggregator
            .upsert(&msg.conversation_key, &msg.user_id)
            .await
            .unwrap();

        (db.clone(), StatusMutator::new(db, aggregator))
    }

    fn unread(m: &Mutation) -> i64 {
        match &m.aggregate {
            AggregateState::Updated(thread) => thread.unread_count,
            other => panic!("thread not updated: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_read_then_unread() {
        let (_db, mutator) = setup().await;
        let user = UserId::from("u1");

        let read = mutator.mark_read("m1", &user).await.unwrap();
        assert!(read.changed);
        assert_eq!(read.message.status, MessageStatus::Read);
        assert_eq!(unread(&read), 0);

        let back = mutator.mark_unread("m1", &user).await.unwrap();
        assert_eq!(back.message.status, MessageStatus::Unread);
        assert_eq!(unread(&back), 1);
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let (_db, mutator) = setup().await;
        let result = mutator.mark_unread("m1", &UserId::from("u1")).await.unwrap();
        assert!(!result.changed);
        assert_eq!(result.aggregate, AggregateState::Skipped);
    }

    #[tokio::test]
    async fn test_other_users_message_not_found() {
        let (db, mutator) = setup().await;
        let err = mutator
            .mark_read("m1", &UserId::from("intruder"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MessageNotFound(_)));

        let untouched = db
            .get_message(&UserId::from("u1"), "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, MessageStatus::Unread);
    }

    #[tokio::test]
    async fn test_move_to_trash_drops_unread() {
        let (_db, mutator) = setup().await;
        let user = UserId::from("u1");

        let trashed = mutator
            .move_to_folder("m1", &user, Folder::Trash)
            .await
            .unwrap();
        assert_eq!(trashed.message.folder, Folder::Trash);
        assert_eq!(trashed.message.status, MessageStatus::Unread);
        assert_eq!(unread(&trashed), 0);

        let archived = mutator.archive("m1", &user).await.unwrap();
        assert_eq!(archived.message.folder, Folder::Archived);
        assert_eq!(unread(&archived), 1);
    }
}
