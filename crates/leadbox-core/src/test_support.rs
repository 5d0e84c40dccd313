//! Storage wrapper that fails selected operations on demand

use crate::conversation::ConversationKey;
use crate::models::{
    CampaignSender, Contact, Folder, Message, MessageStatus, NewMessage, Thread, UserId,
};
use crate::storage::{ConversationStats, MessageInsert, Storage, ThreadDraft};
use crate::{CoreError, CoreResult, Database};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct FlakyStorage {
    inner: Arc<Database>,
    thread_writes_down: AtomicBool,
    reads_down: AtomicBool,
}

impl FlakyStorage {
    pub fn new(inner: Arc<Database>) -> Self {
        Self {
            inner,
            thread_writes_down: AtomicBool::new(false),
            reads_down: AtomicBool::new(false),
        }
    }

    /// Fail thread inserts and updates
    pub fn fail_thread_writes(&self, down: bool) {
        self.thread_writes_down.store(down, Ordering::SeqCst);
    }

    /// Fail the folder and thread list views
    pub fn fail_reads(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> CoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CoreError::DatabaseError("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn find_campaign_senders(&self, email: &str) -> CoreResult<Vec<CampaignSender>> {
        self.inner.find_campaign_senders(email).await
    }

    async fn find_contact(&self, email: &str) -> CoreResult<Option<Contact>> {
        self.inner.find_contact(email).await
    }

    async fn insert_message_if_absent(&self, message: &NewMessage) -> CoreResult<MessageInsert> {
        self.inner.insert_message_if_absent(message).await
    }

    async fn get_message(&self, user: &UserId, message_id: &str) -> CoreResult<Option<Message>> {
        self.inner.get_message(user, message_id).await
    }

    async fn set_message_status(
        &self,
        user: &UserId,
        message_id: &str,
        status: MessageStatus,
    ) -> CoreResult<Option<Message>> {
        self.inner.set_message_status(user, message_id, status).await
    }

    async fn set_message_folder(
        &self,
        user: &UserId,
        message_id: &str,
        folder: &Folder,
    ) -> CoreResult<Option<Message>> {
        self.inner.set_message_folder(user, message_id, folder).await
    }

    async fn conversation_messages(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<Vec<Message>> {
        self.inner.conversation_messages(user, key).await
    }

    async fn conversation_stats(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<ConversationStats> {
        self.inner.conversation_stats(user, key).await
    }

    async fn get_thread(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<Option<Thread>> {
        self.inner.get_thread(user, key).await
    }

    async fn insert_thread(&self, draft: &ThreadDraft) -> CoreResult<Option<Thread>> {
        Self::check(&self.thread_writes_down)?;
        self.inner.insert_thread(draft).await
    }

    async fn update_thread(
        &self,
        draft: &ThreadDraft,
        expected_version: i64,
    ) -> CoreResult<Option<Thread>> {
        Self::check(&self.thread_writes_down)?;
        self.inner.update_thread(draft, expected_version).await
    }

    async fn conversation_keys(&self, user: &UserId) -> CoreResult<Vec<ConversationKey>> {
        self.inner.conversation_keys(user).await
    }

    async fn unread_by_folder(&self, user: &UserId) -> CoreResult<Vec<(String, i64)>> {
        Self::check(&self.reads_down)?;
        self.inner.unread_by_folder(user).await
    }

    async fn list_threads(&self, user: &UserId) -> CoreResult<Vec<Thread>> {
        Self::check(&self.reads_down)?;
        self.inner.list_threads(user).await
    }
}
