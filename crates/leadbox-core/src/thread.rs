//! Thread aggregation
//!
//! A thread row is a materialized view over the messages of one
//! conversation. Every write recomputes the counts from the message rows
//! instead of incrementing them, and lands with a compare-and-swap on the
//! thread's version so that racing writers cannot lose each other's updates.

use crate::config::EngineConfig;
use crate::conversation::ConversationKey;
use crate::models::{Thread, UserId};
use crate::storage::{ConversationStats, Storage, ThreadDraft};
use crate::{CoreError, CoreResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a reconciliation pass over a user's threads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Conversation keys examined
    pub scanned: usize,
    /// Threads whose stored summary differed from the recomputed one
    pub corrected: usize,
    /// Keys that could not be recomputed
    pub failed: usize,
}

/// Keeps thread summaries consistent with their messages
pub struct ThreadAggregator {
    storage: Arc<dyn Storage>,
    cas_retries: u32,
    preview_length: usize,
}

impl ThreadAggregator {
    pub fn new(storage: Arc<dyn Storage>, config: &EngineConfig) -> Self {
        Self {
            storage,
            cas_retries: config.thread_cas_retries,
            preview_length: config.preview_length,
        }
    }

    /// Recompute and store the thread for a conversation.
    ///
    /// Creates the thread on the first message of a conversation. Fails with
    /// `ConversationNotFound` when there is neither a message nor a thread.
    pub async fn upsert(&self, key: &ConversationKey, user: &UserId) -> CoreResult<Thread> {
        for attempt in 1..=self.cas_retries {
            // Read the thread before the stats so a concurrent write invalidates our version
            let existing = self.storage.get_thread(user, key).await?;
            let stats = self.storage.conversation_stats(user, key).await?;

            let draft = match self.draft(user, key, &stats, existing.as_ref()) {
                Some(draft) => draft,
                None => return Err(CoreError::ConversationNotFound(key.to_string())),
            };

            let written = match &existing {
                None => self.storage.insert_thread(&draft).await?,
                Some(thread) => self.storage.update_thread(&draft, thread.version).await?,
            };

            match written {
                Some(thread) => {
                    debug!(
                        "Thread {} for user {}: {} messages, {} unread (v{})",
                        key, user, thread.message_count, thread.unread_count, thread.version
                    );
                    return Ok(thread);
                }
                None => {
                    debug!("Thread {} changed concurrently, retry {}", key, attempt);
                    tokio::task::yield_now().await;
                }
            }
        }

        warn!("Giving up on thread {} after {} attempts", key, self.cas_retries);
        Err(CoreError::ConcurrentUpdate(key.to_string()))
    }

    /// Recompute every thread a user has, healing drift left by writers that
    /// bypassed the aggregator
    pub async fn rebuild_all(&self, user: &UserId) -> CoreResult<RebuildReport> {
        let keys = self.storage.conversation_keys(user).await?;
        let mut report = RebuildReport::default();

        for key in &keys {
            report.scanned += 1;

            let before = match self.storage.get_thread(user, key).await {
                Ok(thread) => thread,
                Err(e) => {
                    error!("Failed to read thread {} during rebuild: {}", key, e);
                    report.failed += 1;
                    continue;
                }
            };

            match self.upsert(key, user).await {
                Ok(after) => {
                    let drifted = before.map_or(true, |b| !same_summary(&b, &after));
                    if drifted {
                        report.corrected += 1;
                    }
                }
                Err(e) => {
                    error!("Failed to rebuild thread {}: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Rebuilt threads for user {}: {} scanned, {} corrected, {} failed",
            user, report.scanned, report.corrected, report.failed
        );
        Ok(report)
    }

    /// Build the values to store, or `None` if the conversation does not exist
    fn draft(
        &self,
        user: &UserId,
        key: &ConversationKey,
        stats: &ConversationStats,
        existing: Option<&Thread>,
    ) -> Option<ThreadDraft> {
        match (&stats.latest, existing) {
            (Some(latest), _) => Some(ThreadDraft {
                user_id: user.clone(),
                conversation_key: key.clone(),
                contact_email: latest.contact_email.clone(),
                campaign_id: latest.campaign_id.clone(),
                subject: latest.subject.clone(),
                message_count: stats.message_count,
                unread_count: stats.unread_count,
                last_message_preview: preview_text(
                    &latest.body_text,
                    latest.body_html.as_deref(),
                    self.preview_length,
                ),
                last_activity_at: Some(latest.activity_at()),
            }),
            // Messages were removed outside this core; keep the thread, zero its counts
            (None, Some(thread)) => Some(ThreadDraft {
                user_id: user.clone(),
                conversation_key: key.clone(),
                contact_email: thread.contact_email.clone(),
                campaign_id: thread.campaign_id.clone(),
                subject: thread.subject.clone(),
                message_count: 0,
                unread_count: 0,
                last_message_preview: String::new(),
                last_activity_at: thread.last_activity_at,
            }),
            (None, None) => None,
        }
    }
}

/// Whether two thread rows carry the same derived summary, ignoring bookkeeping columns
fn same_summary(a: &Thread, b: &Thread) -> bool {
    a.message_count == b.message_count
        && a.unread_count == b.unread_count
        && a.subject == b.subject
        && a.last_message_preview == b.last_message_preview
        && a.last_activity_at == b.last_activity_at
        && a.contact_email == b.contact_email
        && a.campaign_id == b.campaign_id
}

/// Short preview of a message body with quoted reply history removed
pub fn preview_text(body_text: &str, body_html: Option<&str>, max_chars: usize) -> String {
    let source = if body_text.trim().is_empty() {
        body_html.map(strip_tags).unwrap_or_default()
    } else {
        body_text.to_string()
    };

    let reply = collapse_whitespace(&strip_quoted(&source));
    let text = if reply.is_empty() {
        collapse_whitespace(&source)
    } else {
        reply
    };

    text.chars().take(max_chars).collect()
}

/// Drop everything from an "On ... wrote:" attribution line, and `>` quoted lines
fn strip_quoted(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();

    let mut cut = lines.len();
    for (i, line) in lines.iter().enumerate() {
        if !line.trim_end().ends_with("wrote:") {
            continue;
        }
        if line.trim_start().starts_with("On ") {
            cut = i;
            break;
        }
        // Attribution wrapped over two lines
        if i > 0 && lines[i - 1].trim_start().starts_with("On ") {
            cut = i - 1;
            break;
        }
    }

    lines[..cut]
        .iter()
        .filter(|line| !line.trim_start().starts_with('>'))
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Folder, MessageStatus, NewMessage};
    use crate::storage::MessageInsert;
    use crate::Database;
    use chrono::{TimeZone, Utc};

    fn key() -> ConversationKey {
        ConversationKey::derive("prospect@example.com", "sales@acme.com")
    }

    fn message(id: &str, direction: Direction, minute: u32, body: &str) -> NewMessage {
        NewMessage {
            user_id: UserId::from("u1"),
            message_id: id.to_string(),
            conversation_key: key(),
            campaign_id: Some("c1".into()),
            direction,
            folder: None,
            status: None,
            subject: format!("Subject {id}"),
            body_text: body.to_string(),
            body_html: None,
            sender_email: "sales@acme.com".into(),
            contact_email: "prospect@example.com".into(),
            contact_name: None,
            provider_thread_id: None,
            sent_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()),
            has_attachments: false,
        }
    }

    async fn setup() -> (Arc<Database>, ThreadAggregator) {
        let db = Arc::new(Database::open_memory().await.unwrap());
        let aggregator = ThreadAggregator::new(db.clone(), &EngineConfig::default());
        (db, aggregator)
    }

    async fn insert(db: &Database, msg: &NewMessage) {
        let outcome = db.insert_message_if_absent(msg).await.unwrap();
        assert!(matches!(outcome, MessageInsert::Inserted(_)));
    }

    #[tokio::test]
    async fn test_creates_then_updates_in_place() {
        let (db, aggregator) = setup().await;
        let user = UserId::from("u1");

        insert(&db, &message("m1", Direction::Inbound, 0, "First")).await;
        let created = aggregator.upsert(&key(), &user).await.unwrap();
        assert_eq!(created.message_count, 1);
        assert_eq!(created.unread_count, 1);

        insert(&db, &message("m2", Direction::Outbound, 5, "Reply")).await;
        let updated = aggregator.upsert(&key(), &user).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.message_count, 2);
        assert_eq!(updated.unread_count, 1);
        assert_eq!(updated.subject, "Subject m2");
        assert_eq!(updated.last_message_preview, "Reply");
        assert!(updated.version > created.version);
    }

    #[tokio::test]
    async fn test_latest_by_sent_at_not_arrival() {
        let (db, aggregator) = setup().await;

        insert(&db, &message("late", Direction::Inbound, 30, "Newest")).await;
        insert(&db, &message("early", Direction::Inbound, 1, "Oldest")).await;

        let thread = aggregator.upsert(&key(), &UserId::from("u1")).await.unwrap();
        assert_eq!(thread.last_message_preview, "Newest");
        assert_eq!(
            thread.last_activity_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_trash_excluded_from_unread() {
        let (db, aggregator) = setup().await;
        let mut trashed = message("m1", Direction::Inbound, 0, "Spam");
        trashed.folder = Some(Folder::Trash);
        insert(&db, &trashed).await;
        insert(&db, &message("m2", Direction::Inbound, 1, "Real")).await;

        let thread = aggregator.upsert(&key(), &UserId::from("u1")).await.unwrap();
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.unread_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let (_db, aggregator) = setup().await;
        let err = aggregator
            .upsert(&key(), &UserId::from("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn test_rebuild_heals_drift() {
        let (db, aggregator) = setup().await;
        let user = UserId::from("u1");

        insert(&db, &message("m1", Direction::Inbound, 0, "One")).await;
        aggregator.upsert(&key(), &user).await.unwrap();

        // Writes that bypass the aggregator
        insert(&db, &message("m2", Direction::Inbound, 1, "Two")).await;
        sqlx::query("UPDATE threads SET unread_count = 42")
            .execute(db.pool())
            .await
            .unwrap();

        let other = ConversationKey::derive("someone@else.com", "sales@acme.com");
        let mut orphan = message("m3", Direction::Inbound, 2, "Three");
        orphan.conversation_key = other.clone();
        insert(&db, &orphan).await;

        let report = aggregator.rebuild_all(&user).await.unwrap();
        assert_eq!(
            report,
            RebuildReport {
                scanned: 2,
                corrected: 2,
                failed: 0
            }
        );

        let thread = db.get_thread(&user, &key()).await.unwrap().unwrap();
        assert_eq!(thread.message_count, 2);
        assert_eq!(thread.unread_count, 2);
        assert!(db.get_thread(&user, &other).await.unwrap().is_some());

        let again = aggregator.rebuild_all(&user).await.unwrap();
        assert_eq!(again.corrected, 0);
    }

    #[tokio::test]
    async fn test_rebuild_counts_summary_drift() {
        let (db, aggregator) = setup().await;
        let user = UserId::from("u1");

        insert(&db, &message("m1", Direction::Inbound, 0, "One")).await;
        aggregator.upsert(&key(), &user).await.unwrap();

        // Counters intact, summary columns edited behind the aggregator
        sqlx::query("UPDATE threads SET subject = 'edited', last_message_preview = 'stale'")
            .execute(db.pool())
            .await
            .unwrap();

        let report = aggregator.rebuild_all(&user).await.unwrap();
        assert_eq!(report.corrected, 1);

        let thread = db.get_thread(&user, &key()).await.unwrap().unwrap();
        assert_eq!(thread.subject, "Subject m1");
        assert_eq!(thread.last_message_preview, "One");
    }

    #[tokio::test]
    async fn test_status_change_reflected_after_upsert() {
        let (db, aggregator) = setup().await;
        let user = UserId::from("u1");
        insert(&db, &message("m1", Direction::Inbound, 0, "One")).await;
        aggregator.upsert(&key(), &user).await.unwrap();

        db.set_message_status(&user, "m1", MessageStatus::Read)
            .await
            .unwrap();
        let thread = aggregator.upsert(&key(), &user).await.unwrap();
        assert_eq!(thread.unread_count, 0);
    }

    #[test]
    fn test_preview_strips_quoted_reply() {
        let body = "Sounds great, let's talk Tuesday.\n\nOn Mon, May 1, 2024 at 10:00 AM Sales <sales@acme.com> wrote:\n> Would you be open to a call?\n> Thanks";
        assert_eq!(
            preview_text(body, None, 150),
            "Sounds great, let's talk Tuesday."
        );
    }

    #[test]
    fn test_preview_wrapped_attribution_and_quotes() {
        let body = "Yes please\n> inline quote\nOn Mon, May 1, 2024 at 10:00 AM Sales\n<sales@acme.com> wrote:\n> old";
        assert_eq!(preview_text(body, None, 150), "Yes please");
    }

    #[test]
    fn test_preview_falls_back_and_truncates() {
        assert_eq!(preview_text("> only quoted", None, 150), "> only quoted");
        assert_eq!(preview_text("", Some("<p>Hello <b>there</b></p>"), 150), "Hello there");
        assert_eq!(preview_text("abcdefgh", None, 3), "abc");
    }
}
