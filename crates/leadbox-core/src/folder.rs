//! Per-folder unread counters for badge rendering

use crate::models::UserId;
use crate::storage::Storage;
use crate::CoreResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Folder name to unread count. Folders without unread mail are absent.
pub type FolderCounts = BTreeMap<String, i64>;

/// Computes unread totals straight from the message rows on every call
pub struct FolderCounter {
    storage: Arc<dyn Storage>,
}

impl FolderCounter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Unread messages per folder for a user, trash excluded
    pub async fn unread_by_folder(&self, user: &UserId) -> CoreResult<FolderCounts> {
        let rows = self.storage.unread_by_folder(user).await?;
        Ok(rows.into_iter().filter(|(_, count)| *count > 0).collect())
    }

    /// Badge view: an empty map when counts cannot be computed
    pub async fn badges(&self, user: &UserId) -> FolderCounts {
        match self.unread_by_folder(user).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Unread counts unavailable for user {}: {}", user, e);
                FolderCounts::new()
            }
        }
    }
}
