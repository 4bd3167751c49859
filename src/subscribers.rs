//! Subscriber fan-out.
//!
//! Tracks which observers watch which keys and delivers updates after the
//! store has committed. Delivery is revision-gated: an observer receives each
//! distinct (value, status) change at most once, no matter how many cascades
//! or refetches touch the entry in between. Fetch errors are delivered
//! unconditionally since they do not advance the entry revision.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::entry::EntryStatus;
use crate::error::FetchError;
use crate::key::{CanonicalKey, QueryKey};
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "requery::subscribers";

pub type SubscriptionId = Uuid;

/// One notification delivered to an observer of a key.
#[derive(Debug, Clone)]
pub struct QueryUpdate {
    pub status: EntryStatus,
    pub value: Option<Value>,
    pub error: Option<FetchError>,
    /// Entry revision this update reflects. Zero for pure error updates.
    pub revision: u64,
}

struct SubscriberSlot {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<QueryUpdate>,
    last_seen_revision: u64,
}

/// Per-key observer registry.
pub struct SubscriberHub {
    by_key: RwLock<HashMap<CanonicalKey, Vec<SubscriberSlot>>>,
    key_of: RwLock<HashMap<SubscriptionId, CanonicalKey>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self {
            by_key: RwLock::new(HashMap::new()),
            key_of: RwLock::new(HashMap::new()),
        }
    }

    /// Register an observer for `key`. `seen_revision` is the revision the
    /// observer already holds (its initial snapshot), so it is not re-notified
    /// for state it has seen.
    pub fn subscribe(
        &self,
        key: &CanonicalKey,
        seen_revision: u64,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<QueryUpdate>) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut by_key = rw_write(&self.by_key, SOURCE, "subscribe");
        let mut key_of = rw_write(&self.key_of, SOURCE, "subscribe.key_of");
        by_key.entry(key.clone()).or_default().push(SubscriberSlot {
            id,
            sender,
            last_seen_revision: seen_revision,
        });
        key_of.insert(id, key.clone());

        debug!(key = %key, subscription_id = %id, "Subscriber registered");
        (id, receiver)
    }

    /// Remove an observer. Other observers of the same key are unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut by_key = rw_write(&self.by_key, SOURCE, "unsubscribe");
        let mut key_of = rw_write(&self.key_of, SOURCE, "unsubscribe.key_of");

        let Some(key) = key_of.remove(&id) else {
            return false;
        };
        if let Some(slots) = by_key.get_mut(&key) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                by_key.remove(&key);
            }
        }
        debug!(key = %key, subscription_id = %id, "Subscriber removed");
        true
    }

    /// Deliver a committed (value, status) change to every observer of `key`
    /// that has not yet seen `update.revision`. Returns the delivery count.
    pub fn notify(&self, key: &CanonicalKey, update: &QueryUpdate) -> usize {
        let mut by_key = rw_write(&self.by_key, SOURCE, "notify");
        let Some(slots) = by_key.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain_mut(|slot| {
            if slot.last_seen_revision >= update.revision {
                return true;
            }
            match slot.sender.send(update.clone()) {
                Ok(()) => {
                    slot.last_seen_revision = update.revision;
                    delivered += 1;
                    true
                }
                // Receiver dropped without unsubscribing; reap the slot.
                Err(_) => false,
            }
        });
        if slots.is_empty() {
            by_key.remove(key);
        }
        delivered
    }

    /// Deliver a fetch error to every observer of `key`. Errors do not advance
    /// the entry revision and are never deduplicated.
    pub fn notify_error(&self, key: &CanonicalKey, status: EntryStatus, error: FetchError) {
        let mut by_key = rw_write(&self.by_key, SOURCE, "notify_error");
        let Some(slots) = by_key.get_mut(key) else {
            return;
        };
        let update = QueryUpdate {
            status,
            value: None,
            error: Some(error),
            revision: 0,
        };
        slots.retain(|slot| slot.sender.send(update.clone()).is_ok());
        if slots.is_empty() {
            by_key.remove(key);
        }
    }

    pub fn subscriber_count(&self, key: &CanonicalKey) -> usize {
        rw_read(&self.by_key, SOURCE, "subscriber_count")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Every key with at least one active observer.
    pub fn subscribed_keys(&self) -> HashSet<CanonicalKey> {
        rw_read(&self.by_key, SOURCE, "subscribed_keys")
            .keys()
            .cloned()
            .collect()
    }

    /// Subscribed keys falling under `prefix`.
    pub fn subscribed_under(&self, prefix: &QueryKey) -> Vec<CanonicalKey> {
        rw_read(&self.by_key, SOURCE, "subscribed_under")
            .keys()
            .filter(|key| prefix.is_prefix_of(key.query_key()))
            .cloned()
            .collect()
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}
