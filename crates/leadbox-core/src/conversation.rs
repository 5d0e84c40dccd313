//! Conversation key derivation
//!
//! A conversation is every message exchanged between one contact address and
//! one campaign sender address. The key is computed from those two addresses
//! alone, so it needs no database lookup and does not depend on which side
//! wrote the message.

use crate::identity::normalize_address;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, transport-safe conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Derive the key for a contact/sender pair.
    ///
    /// Addresses are normalized and sorted, then length-prefixed so that no
    /// two distinct pairs can produce the same encoded input.
    pub fn derive(contact_email: &str, sender_email: &str) -> Self {
        let mut pair = [normalize_address(contact_email), normalize_address(sender_email)];
        pair.sort();

        let joined = format!("{}:{}|{}", pair[0].len(), pair[0], pair[1]);
        Self(URL_SAFE_NO_PAD.encode(joined.as_bytes()))
    }

    /// Wrap a key read back from storage
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
