//! Identity resolution
//!
//! Decides which side of an email is one of the user's campaign senders and
//! which side is the contact. The side that matches a sender also fixes the
//! message direction and the owning user.

use crate::models::{CampaignSender, Contact, Direction, UserId};
use crate::storage::Storage;
use crate::{CoreError, CoreResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reduce a single mailbox to a bare, lowercased address.
///
/// Accepts `Name <addr>`, `addr (comment)` and plain `addr` forms. Only the
/// first `<...>` group is used.
pub fn normalize_address(raw: &str) -> String {
    let raw = raw.trim();

    if let Some(start) = raw.find('<') {
        if let Some(len) = raw[start + 1..].find('>') {
            return raw[start + 1..start + 1 + len].trim().to_lowercase();
        }
    }

    raw.split_whitespace()
        .find(|token| token.contains('@'))
        .unwrap_or(raw)
        .trim_matches(|c: char| c == ',' || c == ';')
        .to_lowercase()
}

/// Split an address header into its normalized mailboxes, in header order.
///
/// Commas inside quoted display names or angle brackets do not split.
pub fn header_addresses(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in raw.chars() {
        match c {
            '"' if !in_angle => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' | ';' if !in_quotes && !in_angle => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);

    parts
        .iter()
        .map(|part| normalize_address(part))
        .filter(|addr| !addr.is_empty())
        .collect()
}

/// Who a message belongs to and which way it travelled
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub user_id: UserId,
    pub direction: Direction,
    pub sender: CampaignSender,
    /// Normalized address of the non-sender side
    pub contact_email: String,
    /// Imported contact record, when one exists
    pub contact: Option<Contact>,
    /// Both addresses matched a campaign sender and the tie-break policy applied
    pub ambiguous: bool,
}

/// Resolves raw `from`/`to` pairs against registered campaign senders
pub struct IdentityResolver {
    storage: Arc<dyn Storage>,
}

impl IdentityResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Resolve a message's addresses to a user, sender, contact and direction.
    ///
    /// When both sides are campaign senders, the lexically smaller address is
    /// treated as the sender.
    pub async fn resolve(&self, from: &str, to: &str) -> CoreResult<Resolution> {
        let from_addrs = header_addresses(from);
        let to_addrs = header_addresses(to);

        let to_match = self.first_sender(&to_addrs).await?;
        let from_match = self.first_sender(&from_addrs).await?;

        let (direction, senders, contact_email, ambiguous) = match (to_match, from_match) {
            (Some((_, senders)), None) => {
                (Direction::Inbound, senders, first_or_empty(&from_addrs), false)
            }
            (None, Some((_, senders))) => {
                (Direction::Outbound, senders, first_or_empty(&to_addrs), false)
            }
            (None, None) => {
                return Err(CoreError::UnresolvedSender {
                    from: from_addrs.join(", "),
                    to: to_addrs.join(", "),
                });
            }
            (Some((to_addr, to_senders)), Some((from_addr, from_senders))) => {
                warn!(
                    "Both {} and {} are campaign senders, using the lexically smaller as sender",
                    from_addr, to_addr
                );
                if from_addr <= to_addr {
                    (Direction::Outbound, from_senders, to_addr, true)
                } else {
                    (Direction::Inbound, to_senders, from_addr, true)
                }
            }
        };

        if senders.len() > 1 {
            warn!(
                "{} campaign senders registered for {}, using campaign {}",
                senders.len(),
                senders[0].email,
                senders[0].campaign_id
            );
        }
        let sender = senders
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::DatabaseError("sender list emptied".into()))?;

        let contact = self.storage.find_contact(&contact_email).await?;

        debug!(
            "Resolved {} message for user {} (sender {}, contact {})",
            direction.as_str(),
            sender.user_id,
            sender.email,
            contact_email
        );

        Ok(Resolution {
            user_id: sender.user_id.clone(),
            direction,
            sender,
            contact_email,
            contact,
            ambiguous,
        })
    }

    /// First address, in header order, registered as a campaign sender
    async fn first_sender(
        &self,
        addrs: &[String],
    ) -> CoreResult<Option<(String, Vec<CampaignSender>)>> {
        for addr in addrs {
            let senders = self.storage.find_campaign_senders(addr).await?;
            if !senders.is_empty() {
                return Ok(Some((addr.clone(), senders)));
            }
        }
        Ok(None)
    }
}

fn first_or_empty(addrs: &[String]) -> String {
    addrs.first().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthMode;
    use crate::Database;

    async fn seeded() -> (Arc<Database>, IdentityResolver) {
        let db = Arc::new(Database::open_memory().await.unwrap());
        for (email, campaign, user) in [
            ("sales@acme.com", "c1", "u1"),
            ("founder@acme.com", "c2", "u1"),
        ] {
            db.upsert_campaign_sender(&CampaignSender {
                email: email.into(),
                campaign_id: campaign.into(),
                user_id: UserId::from(user),
                display_name: None,
                auth_mode: AuthMode::Smtp,
            })
            .await
            .unwrap();
        }
        db.upsert_contact(&Contact {
            email: "prospect@example.com".into(),
            display_name: Some("Pat Prospect".into()),
            organization: Some("Example Inc".into()),
        })
        .await
        .unwrap();

        let resolver = IdentityResolver::new(db.clone());
        (db, resolver)
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("  Sales@Acme.COM "), "sales@acme.com");
        assert_eq!(normalize_address("Pat <Pat@Example.com>"), "pat@example.com");
        assert_eq!(normalize_address("pat@example.com (Pat)"), "pat@example.com");
        assert_eq!(normalize_address("sales@acme.com,"), "sales@acme.com");
    }

    #[test]
    fn test_header_addresses_multiple_recipients() {
        assert_eq!(
            header_addresses("Sales <sales@acme.com>, Bob <bob@x.com>"),
            vec!["sales@acme.com", "bob@x.com"]
        );
        assert_eq!(
            header_addresses("sales@acme.com, bob@x.com"),
            vec!["sales@acme.com", "bob@x.com"]
        );
        assert_eq!(
            header_addresses("\"Doe, Jane\" <Jane@X.com>; ops@x.com"),
            vec!["jane@x.com", "ops@x.com"]
        );
    }

    #[tokio::test]
    async fn test_inbound_when_sender_in_to() {
        let (_db, resolver) = seeded().await;
        let res = resolver
            .resolve("Pat <prospect@example.com>", " SALES@acme.com ")
            .await
            .unwrap();

        assert_eq!(res.direction, Direction::Inbound);
        assert_eq!(res.user_id, UserId::from("u1"));
        assert_eq!(res.sender.campaign_id, "c1");
        assert_eq!(res.contact_email, "prospect@example.com");
        assert_eq!(
            res.contact.and_then(|c| c.display_name).as_deref(),
            Some("Pat Prospect")
        );
        assert!(!res.ambiguous);
    }

    #[tokio::test]
    async fn test_outbound_when_sender_in_from() {
        let (_db, resolver) = seeded().await;
        let res = resolver
            .resolve("sales@acme.com", "stranger@elsewhere.org")
            .await
            .unwrap();

        assert_eq!(res.direction, Direction::Outbound);
        assert_eq!(res.contact_email, "stranger@elsewhere.org");
        assert!(res.contact.is_none());
    }

    #[tokio::test]
    async fn test_unresolved_sender() {
        let (_db, resolver) = seeded().await;
        let err = resolver
            .resolve("a@nowhere.com", "b@nowhere.com")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnresolvedSender { .. }));
    }

    #[tokio::test]
    async fn test_ambiguous_prefers_lexically_first() {
        let (_db, resolver) = seeded().await;

        let res = resolver
            .resolve("sales@acme.com", "founder@acme.com")
            .await
            .unwrap();
        assert!(res.ambiguous);
        assert_eq!(res.sender.email, "founder@acme.com");
        assert_eq!(res.direction, Direction::Inbound);
        assert_eq!(res.contact_email, "sales@acme.com");

        let reverse = resolver
            .resolve("founder@acme.com", "sales@acme.com")
            .await
            .unwrap();
        assert_eq!(reverse.sender.email, "founder@acme.com");
        assert_eq!(reverse.direction, Direction::Outbound);
    }

    #[tokio::test]
    async fn test_inbound_reply_with_cc_resolves() {
        let (_db, resolver) = seeded().await;

        let res = resolver
            .resolve(
                "Pat <prospect@example.com>",
                "Sales <sales@acme.com>, Bob <bob@x.com>",
            )
            .await
            .unwrap();
        assert_eq!(res.direction, Direction::Inbound);
        assert_eq!(res.sender.email, "sales@acme.com");
        assert_eq!(res.contact_email, "prospect@example.com");

        // Sender listed after another recipient
        let later = resolver
            .resolve("prospect@example.com", "bob@x.com, sales@acme.com")
            .await
            .unwrap();
        assert_eq!(later.sender.email, "sales@acme.com");
        assert_eq!(later.direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn test_outbound_contact_is_first_recipient() {
        let (_db, resolver) = seeded().await;
        let res = resolver
            .resolve("sales@acme.com", "prospect@example.com, bob@x.com")
            .await
            .unwrap();
        assert_eq!(res.direction, Direction::Outbound);
        assert_eq!(res.contact_email, "prospect@example.com");
    }
}
