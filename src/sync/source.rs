use anyhow::Result;
use nostr_sdk::prelude::*;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// A verified follow-list event as the pipeline consumes it. Id and
/// signature have been checked upstream; tags are carried raw and
/// parsed by the event processor.
#[derive(Debug, Clone)]
pub struct FollowEvent {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub tags: Vec<Vec<String>>,
}

impl FollowEvent {
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id.to_hex(),
            author: event.pubkey.to_hex(),
            created_at: event.created_at.as_u64(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().to_vec())
                .collect(),
        }
    }

    /// Followed pubkeys from the p-tags: deduplicated, the author
    /// excluded, invalid keys rejected (64 lowercase-insensitive hex
    /// chars required).
    pub fn follow_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tags
            .iter()
            .filter_map(|tag| {
                if tag.len() >= 2 && tag[0] == "p" {
                    let pk = &tag[1];
                    if pk.len() == 64 && pk.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Some(pk.to_string());
                    }
                }
                None
            })
            .filter(|pk| *pk != self.author)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

/// Abstract source of follow-list events. The relay client is the
/// production implementation; tests feed a channel-backed one.
pub trait FollowSource: Send {
    /// Next live event, or `None` when the source is exhausted.
    fn next_event(&mut self) -> impl Future<Output = Result<Option<FollowEvent>>> + Send;

    /// Most recent follow-list event per pubkey, at most one each.
    fn latest(&self, pubkeys: &[String]) -> impl Future<Output = Result<Vec<FollowEvent>>> + Send;
}

/// Relay-backed source. Subscribes to contact-list events created
/// after construction time; older lists are pulled on demand through
/// [`FollowSource::latest`].
pub struct RelaySource {
    client: Client,
    notifications: tokio::sync::broadcast::Receiver<RelayPoolNotification>,
}

impl RelaySource {
    pub async fn connect(relays: &[String]) -> Result<Self> {
        let client = Client::default();
        for relay_url in relays {
            match client.add_relay(relay_url).await {
                Ok(_) => info!("Added relay: {}", relay_url),
                Err(e) => warn!("Failed to add relay {}: {}", relay_url, e),
            }
        }
        client.connect().await;

        let filter = Filter::new()
            .kind(Kind::ContactList)
            .since(Timestamp::now());
        client.subscribe(vec![filter], None).await?;
        info!("Subscribed to contact-list events from {} relays", relays.len());

        let notifications = client.notifications();
        Ok(Self {
            client,
            notifications,
        })
    }
}

impl Clone for RelaySource {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            notifications: self.client.notifications(),
        }
    }
}

impl FollowSource for RelaySource {
    async fn next_event(&mut self) -> Result<Option<FollowEvent>> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.notifications.recv().await {
                Ok(RelayPoolNotification::Event { event, .. }) => {
                    if event.kind == Kind::ContactList {
                        return Ok(Some(FollowEvent::from_event(&event)));
                    }
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    // The pubkey querier re-fetches missed lists later.
                    warn!("Notification stream lagged, {} events skipped", missed);
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn latest(&self, pubkeys: &[String]) -> Result<Vec<FollowEvent>> {
        let authors: Vec<PublicKey> = pubkeys
            .iter()
            .filter_map(|pk| match PublicKey::from_hex(pk) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Skipping unparseable pubkey {}: {}", pk, e);
                    None
                }
            })
            .collect();
        if authors.is_empty() {
            return Ok(Vec::new());
        }

        let filter = Filter::new().kind(Kind::ContactList).authors(authors);
        let events = self
            .client
            .get_events_of(
                vec![filter],
                EventSource::relays(Some(FETCH_TIMEOUT)),
            )
            .await?;

        // Contact lists are replaceable, but different relays may hand
        // back different revisions; keep only the newest per author.
        let mut newest: std::collections::HashMap<String, FollowEvent> = Default::default();
        for event in events {
            let parsed = FollowEvent::from_event(&event);
            match newest.get(&parsed.author) {
                Some(existing) if existing.created_at >= parsed.created_at => {}
                _ => {
                    newest.insert(parsed.author.clone(), parsed);
                }
            }
        }
        Ok(newest.into_values().collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn hex_key(seed: u8) -> String {
        format!("{:064x}", seed as u128)
    }

    #[test]
    fn test_follow_keys_parses_p_tags() {
        let follows = [hex_key(1), hex_key(2)];
        let event = FollowEvent {
            id: "ev".into(),
            author: hex_key(9),
            created_at: 100,
            tags: vec![
                vec!["p".into(), follows[0].clone()],
                vec!["e".into(), hex_key(3)],
                vec!["p".into(), follows[1].clone(), "wss://relay".into()],
            ],
        };
        assert_eq!(event.follow_keys(), follows.to_vec());
    }

    #[test]
    fn test_follow_keys_rejects_invalid_and_self() {
        let author = hex_key(9);
        let valid = hex_key(1);
        let event = FollowEvent {
            id: "ev".into(),
            author: author.clone(),
            created_at: 100,
            tags: vec![
                vec!["p".into(), valid.clone()],
                vec!["p".into(), valid.clone()], // duplicate
                vec!["p".into(), author],        // self-follow
                vec!["p".into(), "not-hex".into()],
                vec!["p".into(), "abcd".into()], // too short
                vec!["p".into()],                // no value
            ],
        };
        assert_eq!(event.follow_keys(), vec![valid]);
    }

    #[test]
    fn test_follow_keys_empty_list() {
        let event = FollowEvent {
            id: "ev".into(),
            author: hex_key(9),
            created_at: 100,
            tags: vec![],
        };
        assert!(event.follow_keys().is_empty());
    }
}
