//! Storage capability consumed by the components
//!
//! Components never talk to a concrete database. They receive an
//! `Arc<dyn Storage>` at construction time, which keeps credentials and
//! connection handling at the process edge.

use crate::conversation::ConversationKey;
use crate::models::{
    CampaignSender, Contact, Folder, Message, MessageStatus, NewMessage, Thread, UserId,
};
use crate::CoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Counts recomputed from the message rows of one conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationStats {
    pub message_count: i64,
    pub unread_count: i64,
    /// Most recent message by sent time, falling back to creation time
    pub latest: Option<Message>,
}

/// Thread values to be written, without storage-managed columns
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadDraft {
    pub user_id: UserId,
    pub conversation_key: ConversationKey,
    pub contact_email: String,
    pub campaign_id: Option<String>,
    pub subject: String,
    pub message_count: i64,
    pub unread_count: i64,
    pub last_message_preview: String,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Outcome of an insert-if-absent message write
#[derive(Debug, Clone)]
pub enum MessageInsert {
    /// Row was written by this call
    Inserted(Message),
    /// A row with the same (user, message id) already existed
    Existing(Message),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// All sender registrations for an address, ordered by (user, campaign)
    async fn find_campaign_senders(&self, email: &str) -> CoreResult<Vec<CampaignSender>>;

    /// Contact record for an address, if imported
    async fn find_contact(&self, email: &str) -> CoreResult<Option<Contact>>;

    /// Atomically insert a message unless one with the same (user, message id) exists
    async fn insert_message_if_absent(&self, message: &NewMessage) -> CoreResult<MessageInsert>;

    /// Message by natural key, scoped to its owner
    async fn get_message(&self, user: &UserId, message_id: &str) -> CoreResult<Option<Message>>;

    /// Set a message's status; `None` when the owner has no such message
    async fn set_message_status(
        &self,
        user: &UserId,
        message_id: &str,
        status: MessageStatus,
    ) -> CoreResult<Option<Message>>;

    /// Move a message to a folder; `None` when the owner has no such message
    async fn set_message_folder(
        &self,
        user: &UserId,
        message_id: &str,
        folder: &Folder,
    ) -> CoreResult<Option<Message>>;

    /// Messages of one conversation, oldest first
    async fn conversation_messages(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<Vec<Message>>;

    /// Counts and latest message computed from the message rows
    async fn conversation_stats(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<ConversationStats>;

    async fn get_thread(&self, user: &UserId, key: &ConversationKey)
        -> CoreResult<Option<Thread>>;

    /// Create a thread row; `None` if another writer created it first
    async fn insert_thread(&self, draft: &ThreadDraft) -> CoreResult<Option<Thread>>;

    /// Overwrite a thread row if its version still matches; `None` on mismatch
    async fn update_thread(
        &self,
        draft: &ThreadDraft,
        expected_version: i64,
    ) -> CoreResult<Option<Thread>>;

    /// Every conversation key a user has messages or a thread for
    async fn conversation_keys(&self, user: &UserId) -> CoreResult<Vec<ConversationKey>>;

    /// (folder, unread count) pairs for unread messages outside trash
    async fn unread_by_folder(&self, user: &UserId) -> CoreResult<Vec<(String, i64)>>;

    /// Threads ordered by last activity, newest first
    async fn list_threads(&self, user: &UserId) -> CoreResult<Vec<Thread>>;
}
