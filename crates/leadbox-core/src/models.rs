//! Data model shared by all components

use crate::conversation::ConversationKey;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of the user who owns campaigns, messages and threads
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which way a message travelled relative to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    /// Folder a new message lands in when the caller does not choose one
    pub fn default_folder(&self) -> Folder {
        match self {
            Direction::Inbound => Folder::Inbox,
            Direction::Outbound => Folder::Sent,
        }
    }

    /// A user's own sent mail is never unread to them
    pub fn default_status(&self) -> MessageStatus {
        match self {
            Direction::Inbound => MessageStatus::Unread,
            Direction::Outbound => MessageStatus::Read,
        }
    }
}

impl FromStr for Direction {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(CoreError::DatabaseError(format!("unknown direction '{other}'"))),
        }
    }
}

/// Read state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unread,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Unread => "unread",
            MessageStatus::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "unread" => Ok(MessageStatus::Unread),
            "read" => Ok(MessageStatus::Read),
            other => Err(CoreError::DatabaseError(format!("unknown status '{other}'"))),
        }
    }
}

/// Coarse mailbox category of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Folder {
    Inbox,
    Sent,
    Trash,
    Archived,
    /// Any user-defined folder, stored lowercased
    Other(String),
}

impl Folder {
    /// Parse a folder name (case-insensitive)
    pub fn from_name(name: &str) -> Self {
        let lower = name.trim().to_lowercase();
        match lower.as_str() {
            "inbox" => Folder::Inbox,
            "sent" => Folder::Sent,
            "trash" => Folder::Trash,
            "archived" => Folder::Archived,
            _ => Folder::Other(lower),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Trash => "trash",
            Folder::Archived => "archived",
            Folder::Other(name) => name,
        }
    }

    /// Messages in trash never count towards unread totals
    pub fn counts_unread(&self) -> bool {
        *self != Folder::Trash
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Folder {
    fn from(s: String) -> Self {
        Folder::from_name(&s)
    }
}

impl From<Folder> for String {
    fn from(f: Folder) -> Self {
        f.as_str().to_string()
    }
}

/// External party, imported by CRM flows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
    pub display_name: Option<String>,
    pub organization: Option<String>,
}

/// How a campaign sender authenticates with its mail provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Smtp,
    OAuth,
    Api,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Smtp => "smtp",
            AuthMode::OAuth => "oauth",
            AuthMode::Api => "api",
        }
    }
}

impl FromStr for AuthMode {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "smtp" => Ok(AuthMode::Smtp),
            "oauth" => Ok(AuthMode::OAuth),
            "api" => Ok(AuthMode::Api),
            other => Err(CoreError::DatabaseError(format!("unknown auth mode '{other}'"))),
        }
    }
}

/// An address a user sends campaign mail from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSender {
    pub email: String,
    pub campaign_id: String,
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub auth_mode: AuthMode,
}

/// A stored email transmission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub user_id: UserId,
    /// Natural key from the transport (Message-ID header)
    pub message_id: String,
    pub conversation_key: ConversationKey,
    pub campaign_id: Option<String>,
    pub direction: Direction,
    pub status: MessageStatus,
    pub folder: Folder,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub sender_email: String,
    pub contact_email: String,
    pub contact_name: Option<String>,
    pub provider_thread_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub has_attachments: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Timestamp used to order messages within a conversation
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.sent_at.unwrap_or(self.created_at)
    }
}

/// A fully resolved message, ready for the ingestor
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: UserId,
    pub message_id: String,
    pub conversation_key: ConversationKey,
    pub campaign_id: Option<String>,
    pub direction: Direction,
    /// Overrides the direction's default folder
    pub folder: Option<Folder>,
    /// Overrides the direction's default status
    pub status: Option<MessageStatus>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub sender_email: String,
    pub contact_email: String,
    pub contact_name: Option<String>,
    pub provider_thread_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub has_attachments: bool,
}

/// Per-user summary of one conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub id: i64,
    pub user_id: UserId,
    pub conversation_key: ConversationKey,
    pub contact_email: String,
    pub campaign_id: Option<String>,
    /// Subject of the most recent message
    pub subject: String,
    pub message_count: i64,
    /// Unread messages outside trash
    pub unread_count: i64,
    pub last_message_preview: String,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Bumped on every write, used for compare-and-swap
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw event handed over by the mail transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundEvent {
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(alias = "text")]
    pub text_body: String,
    #[serde(alias = "html")]
    pub html_body: Option<String>,
    pub message_id: String,
    /// RFC 3339 or RFC 2822 date
    pub date: Option<String>,
    /// Provider-side thread identifier, kept for reference only
    pub thread_id: Option<String>,
    pub has_attachments: bool,
}

impl InboundEvent {
    /// Reject events the transport delivered without their required fields
    pub fn validate(&self) -> CoreResult<()> {
        for (name, value) in [
            ("from", &self.from),
            ("to", &self.to),
            ("messageId", &self.message_id),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::InvalidEvent(format!("missing required field: {name}")));
            }
        }
        Ok(())
    }

    /// Whether the transport sent a non-blank date
    pub fn has_date(&self) -> bool {
        self.date.as_deref().is_some_and(|d| !d.trim().is_empty())
    }

    /// Parse the event date, accepting RFC 3339 and RFC 2822 forms
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.date.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }

        // Strip trailing "(UTC)" style comments before trying RFC 2822
        let mut s = raw.to_string();
        if let Some(paren) = s.rfind('(') {
            s = s[..paren].trim().to_string();
        }
        DateTime::parse_from_rfc2822(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }
}
