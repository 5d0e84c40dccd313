//! Core business logic for Leadbox
//!
//! Turns raw transport events into stored messages, groups them into
//! per-contact conversation threads and keeps the unread aggregates the
//! inbox UI renders.

pub mod config;
pub mod conversation;
mod database;
mod engine;
mod error;
pub mod folder;
pub mod identity;
mod inbox;
pub mod ingest;
pub mod models;
pub mod status;
pub mod storage;
pub mod thread;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use conversation::ConversationKey;
pub use database::Database;
pub use engine::{create_ingest_channels, IngestCommand, IngestEngine, IngestEvent};
pub use error::{CoreError, CoreResult};
pub use folder::FolderCounts;
pub use inbox::Inbox;
pub use storage::Storage;
