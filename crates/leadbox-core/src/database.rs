//! Database storage using SQLite

use crate::conversation::ConversationKey;
use crate::models::{
    AuthMode, CampaignSender, Contact, Folder, Message, MessageStatus, NewMessage, Thread, UserId,
};
use crate::storage::{ConversationStats, MessageInsert, Storage, ThreadDraft};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use tracing::{debug, info};

const MESSAGE_COLUMNS: &str = r#"
    id, user_id, message_id, conversation_key, campaign_id, direction, status,
    folder, subject, body_text, body_html, sender_email, contact_email,
    contact_name, provider_thread_id, sent_at, received_at, has_attachments,
    created_at
"#;

const THREAD_COLUMNS: &str = r#"
    id, user_id, conversation_key, contact_email, campaign_id, subject,
    message_count, unread_count, last_message_preview, last_activity_at,
    version, created_at, updated_at
"#;

/// Database connection pool
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create a database at the given path
    pub async fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        info!("Opening database at {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub async fn open_memory() -> CoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize the database schema
    async fn initialize(&self) -> CoreResult<()> {
        debug!("Initializing database schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                email TEXT PRIMARY KEY,
                display_name TEXT,
                organization TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS campaign_senders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                display_name TEXT,
                auth_mode TEXT NOT NULL DEFAULT 'smtp',
                created_at TEXT DEFAULT (datetime('now')),
                UNIQUE(email, campaign_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                conversation_key TEXT NOT NULL,
                campaign_id TEXT,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                folder TEXT NOT NULL DEFAULT 'inbox',
                subject TEXT NOT NULL DEFAULT '',
                body_text TEXT NOT NULL DEFAULT '',
                body_html TEXT,
                sender_email TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                contact_name TEXT,
                provider_thread_id TEXT,
                sent_at INTEGER,
                received_at INTEGER NOT NULL,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(user_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                conversation_key TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                campaign_id TEXT,
                subject TEXT NOT NULL DEFAULT '',
                message_count INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                last_message_preview TEXT NOT NULL DEFAULT '',
                last_activity_at INTEGER,
                version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(user_id, conversation_key)
            );

            CREATE INDEX IF NOT EXISTS idx_senders_email ON campaign_senders(email);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(user_id, conversation_key);
            CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(user_id, status, folder);
            CREATE INDEX IF NOT EXISTS idx_threads_activity ON threads(user_id, last_activity_at DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema initialized");
        Ok(())
    }

    /// Insert or update a contact (fed by external import flows)
    pub async fn upsert_contact(&self, contact: &Contact) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO contacts (email, display_name, organization)
            VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET
                display_name = excluded.display_name,
                organization = excluded.organization,
                updated_at = datetime('now')
            "#,
        )
        .bind(crate::identity::normalize_address(&contact.email))
        .bind(&contact.display_name)
        .bind(&contact.organization)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or update a campaign sender registration
    pub async fn upsert_campaign_sender(&self, sender: &CampaignSender) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO campaign_senders (email, campaign_id, user_id, display_name, auth_mode)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(email, campaign_id) DO UPDATE SET
                user_id = excluded.user_id,
                display_name = excluded.display_name,
                auth_mode = excluded.auth_mode
            "#,
        )
        .bind(crate::identity::normalize_address(&sender.email))
        .bind(&sender.campaign_id)
        .bind(sender.user_id.as_str())
        .bind(&sender.display_name)
        .bind(sender.auth_mode.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn message_from_row(row: &SqliteRow) -> CoreResult<Message> {
        let direction: String = row.try_get("direction")?;
        let status: String = row.try_get("status")?;
        let folder: String = row.try_get("folder")?;

        Ok(Message {
            id: row.try_get("id")?,
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            message_id: row.try_get("message_id")?,
            conversation_key: ConversationKey::from_stored(
                row.try_get::<String, _>("conversation_key")?,
            ),
            campaign_id: row.try_get("campaign_id")?,
            direction: direction.parse()?,
            status: status.parse()?,
            folder: Folder::from_name(&folder),
            subject: row.try_get("subject")?,
            body_text: row.try_get("body_text")?,
            body_html: row.try_get("body_html")?,
            sender_email: row.try_get("sender_email")?,
            contact_email: row.try_get("contact_email")?,
            contact_name: row.try_get("contact_name")?,
            provider_thread_id: row.try_get("provider_thread_id")?,
            sent_at: opt_from_millis(row.try_get("sent_at")?)?,
            received_at: from_millis(row.try_get("received_at")?)?,
            has_attachments: row.try_get("has_attachments")?,
            created_at: from_millis(row.try_get("created_at")?)?,
        })
    }

    fn thread_from_row(row: &SqliteRow) -> CoreResult<Thread> {
        Ok(Thread {
            id: row.try_get("id")?,
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            conversation_key: ConversationKey::from_stored(
                row.try_get::<String, _>("conversation_key")?,
            ),
            contact_email: row.try_get("contact_email")?,
            campaign_id: row.try_get("campaign_id")?,
            subject: row.try_get("subject")?,
            message_count: row.try_get("message_count")?,
            unread_count: row.try_get("unread_count")?,
            last_message_preview: row.try_get("last_message_preview")?,
            last_activity_at: opt_from_millis(row.try_get("last_activity_at")?)?,
            version: row.try_get("version")?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }
}

fn from_millis(ms: i64) -> CoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::DatabaseError(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> CoreResult<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl Storage for Database {
    async fn find_campaign_senders(&self, email: &str) -> CoreResult<Vec<CampaignSender>> {
        let rows = sqlx::query(
            r#"
            SELECT email, campaign_id, user_id, display_name, auth_mode
            FROM campaign_senders
            WHERE email = ?
            ORDER BY user_id, campaign_id
            "#,
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> CoreResult<CampaignSender> {
                let auth_mode: String = row.try_get("auth_mode")?;
                Ok(CampaignSender {
                    email: row.try_get("email")?,
                    campaign_id: row.try_get("campaign_id")?,
                    user_id: UserId::new(row.try_get::<String, _>("user_id")?),
                    display_name: row.try_get("display_name")?,
                    auth_mode: auth_mode.parse::<AuthMode>()?,
                })
            })
            .collect()
    }

    async fn find_contact(&self, email: &str) -> CoreResult<Option<Contact>> {
        let row = sqlx::query(
            "SELECT email, display_name, organization FROM contacts WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> CoreResult<Contact> {
            Ok(Contact {
                email: row.try_get("email")?,
                display_name: row.try_get("display_name")?,
                organization: row.try_get("organization")?,
            })
        })
        .transpose()
    }

    async fn insert_message_if_absent(&self, msg: &NewMessage) -> CoreResult<MessageInsert> {
        let now = now_millis();
        let folder = msg
            .folder
            .clone()
            .unwrap_or_else(|| msg.direction.default_folder());
        let status = msg.status.unwrap_or_else(|| msg.direction.default_status());

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                user_id, message_id, conversation_key, campaign_id, direction, status,
                folder, subject, body_text, body_html, sender_email, contact_email,
                contact_name, provider_thread_id, sent_at, received_at, has_attachments,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, message_id) DO NOTHING
            "#,
        )
        .bind(msg.user_id.as_str())
        .bind(&msg.message_id)
        .bind(msg.conversation_key.as_str())
        .bind(&msg.campaign_id)
        .bind(msg.direction.as_str())
        .bind(status.as_str())
        .bind(folder.as_str())
        .bind(&msg.subject)
        .bind(&msg.body_text)
        .bind(&msg.body_html)
        .bind(&msg.sender_email)
        .bind(&msg.contact_email)
        .bind(&msg.contact_name)
        .bind(&msg.provider_thread_id)
        .bind(msg.sent_at.map(|dt| dt.timestamp_millis()))
        .bind(now)
        .bind(msg.has_attachments)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        let stored = self
            .get_message(&msg.user_id, &msg.message_id)
            .await?
            .ok_or_else(|| {
                CoreError::DatabaseError(format!(
                    "message {} vanished after insert",
                    msg.message_id
                ))
            })?;

        Ok(if inserted {
            MessageInsert::Inserted(stored)
        } else {
            MessageInsert::Existing(stored)
        })
    }

    async fn get_message(&self, user: &UserId, message_id: &str) -> CoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ? AND message_id = ?"
        ))
        .bind(user.as_str())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::message_from_row).transpose()
    }

    async fn set_message_status(
        &self,
        user: &UserId,
        message_id: &str,
        status: MessageStatus,
    ) -> CoreResult<Option<Message>> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?, updated_at = ? WHERE user_id = ? AND message_id = ?",
        )
        .bind(status.as_str())
        .bind(now_millis())
        .bind(user.as_str())
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(user, message_id).await
    }

    async fn set_message_folder(
        &self,
        user: &UserId,
        message_id: &str,
        folder: &Folder,
    ) -> CoreResult<Option<Message>> {
        let result = sqlx::query(
            "UPDATE messages SET folder = ?, updated_at = ? WHERE user_id = ? AND message_id = ?",
        )
        .bind(folder.as_str())
        .bind(now_millis())
        .bind(user.as_str())
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(user, message_id).await
    }

    async fn conversation_messages(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE user_id = ? AND conversation_key = ?
            ORDER BY COALESCE(sent_at, created_at) ASC, created_at ASC, id ASC
            "#
        ))
        .bind(user.as_str())
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn conversation_stats(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<ConversationStats> {
        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS message_count,
                COALESCE(SUM(CASE WHEN status = 'unread' AND folder <> 'trash' THEN 1 ELSE 0 END), 0)
                    AS unread_count
            FROM messages
            WHERE user_id = ? AND conversation_key = ?
            "#,
        )
        .bind(user.as_str())
        .bind(key.as_str())
        .fetch_one(&self.pool)
        .await?;

        let latest = sqlx::query(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE user_id = ? AND conversation_key = ?
            ORDER BY COALESCE(sent_at, created_at) DESC, created_at DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(user.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(ConversationStats {
            message_count: counts.try_get("message_count")?,
            unread_count: counts.try_get("unread_count")?,
            latest: latest.as_ref().map(Self::message_from_row).transpose()?,
        })
    }

    async fn get_thread(
        &self,
        user: &UserId,
        key: &ConversationKey,
    ) -> CoreResult<Option<Thread>> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ? AND conversation_key = ?"
        ))
        .bind(user.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::thread_from_row).transpose()
    }

    async fn insert_thread(&self, draft: &ThreadDraft) -> CoreResult<Option<Thread>> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO threads (
                user_id, conversation_key, contact_email, campaign_id, subject,
                message_count, unread_count, last_message_preview, last_activity_at,
                version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(user_id, conversation_key) DO NOTHING
            "#,
        )
        .bind(draft.user_id.as_str())
        .bind(draft.conversation_key.as_str())
        .bind(&draft.contact_email)
        .bind(&draft.campaign_id)
        .bind(&draft.subject)
        .bind(draft.message_count)
        .bind(draft.unread_count)
        .bind(&draft.last_message_preview)
        .bind(draft.last_activity_at.map(|dt| dt.timestamp_millis()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_thread(&draft.user_id, &draft.conversation_key).await
    }

    async fn update_thread(
        &self,
        draft: &ThreadDraft,
        expected_version: i64,
    ) -> CoreResult<Option<Thread>> {
        let result = sqlx::query(
            r#"
            UPDATE threads SET
                contact_email = ?,
                campaign_id = ?,
                subject = ?,
                message_count = ?,
                unread_count = ?,
                last_message_preview = ?,
                last_activity_at = ?,
                version = version + 1,
                updated_at = ?
            WHERE user_id = ? AND conversation_key = ? AND version = ?
            "#,
        )
        .bind(&draft.contact_email)
        .bind(&draft.campaign_id)
        .bind(&draft.subject)
        .bind(draft.message_count)
        .bind(draft.unread_count)
        .bind(&draft.last_message_preview)
        .bind(draft.last_activity_at.map(|dt| dt.timestamp_millis()))
        .bind(now_millis())
        .bind(draft.user_id.as_str())
        .bind(draft.conversation_key.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_thread(&draft.user_id, &draft.conversation_key).await
    }

    async fn conversation_keys(&self, user: &UserId) -> CoreResult<Vec<ConversationKey>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_key FROM messages WHERE user_id = ?
            UNION
            SELECT conversation_key FROM threads WHERE user_id = ?
            ORDER BY conversation_key
            "#,
        )
        .bind(user.as_str())
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> CoreResult<ConversationKey> {
                Ok(ConversationKey::from_stored(r.try_get::<String, _>(0)?))
            })
            .collect()
    }

    async fn unread_by_folder(&self, user: &UserId) -> CoreResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT folder, COUNT(*) AS unread
            FROM messages
            WHERE user_id = ? AND status = 'unread' AND folder <> 'trash'
            GROUP BY folder
            ORDER BY folder
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> CoreResult<(String, i64)> {
                Ok((r.try_get("folder")?, r.try_get("unread")?))
            })
            .collect()
    }

    async fn list_threads(&self, user: &UserId) -> CoreResult<Vec<Thread>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {THREAD_COLUMNS} FROM threads
            WHERE user_id = ?
            ORDER BY last_activity_at DESC, id DESC
            "#
        ))
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::thread_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    fn new_message(user: &str, message_id: &str) -> NewMessage {
        NewMessage {
            user_id: UserId::from(user),
            message_id: message_id.to_string(),
            conversation_key: ConversationKey::derive("prospect@example.com", "sales@acme.com"),
            campaign_id: Some("c1".into()),
            direction: Direction::Inbound,
            folder: None,
            status: None,
            subject: "Hi".into(),
            body_text: "Hello".into(),
            body_html: None,
            sender_email: "sales@acme.com".into(),
            contact_email: "prospect@example.com".into(),
            contact_name: None,
            provider_thread_id: None,
            sent_at: None,
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        let msg = new_message("u1", "m1");

        let first = db.insert_message_if_absent(&msg).await.unwrap();
        let second = db.insert_message_if_absent(&msg).await.unwrap();

        let (a, b) = match (first, second) {
            (MessageInsert::Inserted(a), MessageInsert::Existing(b)) => (a, b),
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, MessageStatus::Unread);
        assert_eq!(a.folder, Folder::Inbox);
    }

    #[tokio::test]
    async fn test_message_id_unique_per_user_only() {
        let db = Database::open_memory().await.unwrap();
        db.insert_message_if_absent(&new_message("u1", "m1")).await.unwrap();
        let other = db.insert_message_if_absent(&new_message("u2", "m1")).await.unwrap();
        assert!(matches!(other, MessageInsert::Inserted(_)));
    }

    #[tokio::test]
    async fn test_status_update_scoped_to_owner() {
        let db = Database::open_memory().await.unwrap();
        db.insert_message_if_absent(&new_message("u1", "m1")).await.unwrap();

        let foreign = db
            .set_message_status(&UserId::from("u2"), "m1", MessageStatus::Read)
            .await
            .unwrap();
        assert!(foreign.is_none());

        let own = db
            .set_message_status(&UserId::from("u1"), "m1", MessageStatus::Read)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(own.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_thread_version_compare_and_swap() {
        let db = Database::open_memory().await.unwrap();
        let draft = ThreadDraft {
            user_id: UserId::from("u1"),
            conversation_key: ConversationKey::derive("a@x.com", "b@y.com"),
            contact_email: "a@x.com".into(),
            campaign_id: None,
            subject: "Hi".into(),
            message_count: 1,
            unread_count: 1,
            last_message_preview: "Hello".into(),
            last_activity_at: None,
        };

        let created = db.insert_thread(&draft).await.unwrap().unwrap();
        assert_eq!(created.version, 1);
        assert!(db.insert_thread(&draft).await.unwrap().is_none());

        let updated = db.update_thread(&draft, 1).await.unwrap().unwrap();
        assert_eq!(updated.version, 2);
        assert!(db.update_thread(&draft, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sender_lookup_orders_by_user_then_campaign() {
        let db = Database::open_memory().await.unwrap();
        for (campaign, user) in [("c2", "u1"), ("c1", "u2"), ("c1", "u1")] {
            db.upsert_campaign_sender(&CampaignSender {
                email: "Sales@Acme.com".into(),
                campaign_id: campaign.into(),
                user_id: UserId::from(user),
                display_name: None,
                auth_mode: AuthMode::Smtp,
            })
            .await
            .unwrap();
        }

        let senders = db.find_campaign_senders("sales@acme.com").await.unwrap();
        let order: Vec<_> = senders
            .iter()
            .map(|s| (s.user_id.as_str().to_string(), s.campaign_id.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("u1".to_string(), "c1".to_string()),
                ("u1".to_string(), "c2".to_string()),
                ("u2".to_string(), "c1".to_string()),
            ]
        );
    }
}
