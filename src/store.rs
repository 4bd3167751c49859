//! Cache storage.
//!
//! Single owner of all [`CacheEntry`] values, keyed by canonical key.
//! Prefix operations (`mark_stale`, `invalidate`) walk the key space
//! structurally and return the affected keys so the engine can cancel
//! in-flight fetches and notify subscribers. The store itself never fetches
//! and never fails on valid keys; unknown keys are no-ops.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::entry::{CacheEntry, EntryStatus, Shadow};
use crate::events::Epoch;
use crate::key::{CanonicalKey, QueryKey};
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "requery::store";

/// The result of a prefix cascade for one affected entry.
#[derive(Debug, Clone)]
pub struct CascadeHit {
    pub key: CanonicalKey,
    /// Entry revision after the cascade.
    pub revision: u64,
    pub status: EntryStatus,
    /// False when the entry was already in the target status (idempotent hit:
    /// no notification, no duplicate refetch).
    pub transitioned: bool,
}

/// In-memory cache store.
pub struct CacheStore {
    entries: RwLock<HashMap<CanonicalKey, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Servable view of an entry: its last committed value, if any.
    ///
    /// Returns `None` for unknown, invalidated, and empty entries, forcing a
    /// full fetch. Slides the retention deadline, since a read counts as an
    /// access.
    pub fn get(&self, key: &CanonicalKey, now: OffsetDateTime) -> Option<CacheEntry> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let entry = entries.get_mut(key)?;
        entry.gc_at = now + entry.retention;
        if entry.has_value() {
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Raw view of an entry regardless of status.
    ///
    /// Used by the engine for epoch comparison on settle; does not slide the
    /// retention deadline.
    pub fn entry(&self, key: &CanonicalKey) -> Option<CacheEntry> {
        rw_read(&self.entries, SOURCE, "entry").get(key).cloned()
    }

    /// Commit a fetched value. Overwrites any existing entry, recomputes all
    /// deadlines, and resets status to `Fresh`. Returns the new revision.
    pub fn set(
        &self,
        key: &CanonicalKey,
        value: Value,
        stale_window: Duration,
        retention_window: Duration,
        now: OffsetDateTime,
    ) -> u64 {
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        let revision = entries.get(key).map_or(0, |e| e.revision) + 1;
        let previous_epoch = entries.get(key).map_or(0, |e| e.invalidated_epoch);
        entries.insert(
            key.clone(),
            CacheEntry {
                value: Some(value),
                status: EntryStatus::Fresh,
                fetched_at: now,
                stale_at: now + stale_window,
                gc_at: now + retention_window,
                retention: retention_window,
                revision,
                invalidated_epoch: previous_epoch,
                shadow: None,
            },
        );
        revision
    }

    /// Transition every entry under `prefix` to `Stale`, retaining values for
    /// optimistic display while refetching. Records `epoch` as the entry's
    /// superseding point so older in-flight fetches are discarded on settle.
    pub fn mark_stale(&self, prefix: &QueryKey, epoch: Epoch) -> Vec<CascadeHit> {
        let mut entries = rw_write(&self.entries, SOURCE, "mark_stale");
        let mut hits = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if !prefix.is_prefix_of(key.query_key()) {
                continue;
            }
            match entry.status {
                EntryStatus::Fresh => {
                    entry.status = EntryStatus::Stale;
                    entry.revision += 1;
                    entry.invalidated_epoch = epoch;
                    hits.push(CascadeHit {
                        key: key.clone(),
                        revision: entry.revision,
                        status: EntryStatus::Stale,
                        transitioned: true,
                    });
                }
                EntryStatus::Stale => {
                    entry.invalidated_epoch = epoch;
                    hits.push(CascadeHit {
                        key: key.clone(),
                        revision: entry.revision,
                        status: EntryStatus::Stale,
                        transitioned: false,
                    });
                }
                EntryStatus::Invalidated | EntryStatus::Empty => {
                    entry.invalidated_epoch = epoch;
                    hits.push(CascadeHit {
                        key: key.clone(),
                        revision: entry.revision,
                        status: entry.status,
                        transitioned: false,
                    });
                }
            }
        }
        debug!(prefix = %prefix, affected = hits.len(), "Marked prefix stale");
        hits
    }

    /// Transition every entry under `prefix` to `Invalidated` and clear its
    /// value; the next read blocks on a full fetch instead of stale-serving.
    /// Idempotent: already-invalidated entries are reported without a
    /// transition so no duplicate refetch is triggered.
    pub fn invalidate(&self, prefix: &QueryKey, epoch: Epoch) -> Vec<CascadeHit> {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
        let mut hits = Vec::new();
        for (key, entry) in entries.iter_mut() {
            if !prefix.is_prefix_of(key.query_key()) {
                continue;
            }
            let transitioned = entry.status != EntryStatus::Invalidated;
            if transitioned {
                entry.status = EntryStatus::Invalidated;
                entry.value = None;
                entry.shadow = None;
                entry.revision += 1;
            }
            entry.invalidated_epoch = epoch;
            hits.push(CascadeHit {
                key: key.clone(),
                revision: entry.revision,
                status: EntryStatus::Invalidated,
                transitioned,
            });
        }
        debug!(prefix = %prefix, affected = hits.len(), "Invalidated prefix");
        hits
    }

    /// Remove entries with no active subscription whose retention deadline
    /// has passed. Entries in `subscribed` are never evicted regardless of
    /// `gc_at`. Returns the evicted keys.
    pub fn evict_expired(
        &self,
        now: OffsetDateTime,
        subscribed: &HashSet<CanonicalKey>,
    ) -> Vec<CanonicalKey> {
        let mut entries = rw_write(&self.entries, SOURCE, "evict_expired");
        let expired: Vec<CanonicalKey> = entries
            .iter()
            .filter(|(key, entry)| entry.gc_at <= now && !subscribed.contains(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "Eviction sweep removed entries");
        }
        expired
    }

    // ========================================================================
    // Optimistic updates (shadow slot contract)
    // ========================================================================

    /// Apply a provisional value ahead of a mutation's settle.
    ///
    /// The pre-mutation value and status are retained in the entry's shadow
    /// slot; status becomes `Stale` so readers treat the value as provisional.
    /// Applying on top of an existing shadow keeps the original shadow, so a
    /// rollback always restores the true pre-mutation state.
    pub fn apply_optimistic(
        &self,
        key: &CanonicalKey,
        value: Value,
        now: OffsetDateTime,
        default_retention: Duration,
    ) -> u64 {
        let mut entries = rw_write(&self.entries, SOURCE, "apply_optimistic");
        let entry = entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            value: None,
            status: EntryStatus::Empty,
            fetched_at: now,
            stale_at: now,
            gc_at: now + default_retention,
            retention: default_retention,
            revision: 0,
            invalidated_epoch: 0,
            shadow: None,
        });
        if entry.shadow.is_none() {
            entry.shadow = Some(Shadow {
                value: entry.value.clone(),
                status: entry.status,
                revision: entry.revision,
            });
        }
        entry.value = Some(value);
        entry.status = EntryStatus::Stale;
        entry.revision += 1;
        entry.revision
    }

    /// Restore the shadowed pre-mutation state after a failed mutation.
    ///
    /// Returns the restored revision, or `None` if no shadow was present
    /// (no-op for unknown keys or keys without an optimistic value).
    pub fn rollback_optimistic(&self, key: &CanonicalKey) -> Option<u64> {
        let mut entries = rw_write(&self.entries, SOURCE, "rollback_optimistic");
        let entry = entries.get_mut(key)?;
        let shadow = entry.shadow.take()?;
        entry.value = shadow.value;
        entry.status = shadow.status;
        entry.revision += 1;
        Some(entry.revision)
    }

    /// Discard the shadow after a successful mutation; the provisional value
    /// stays in place until the post-mutation refetch overwrites it.
    pub fn commit_optimistic(&self, key: &CanonicalKey) {
        let mut entries = rw_write(&self.entries, SOURCE, "commit_optimistic");
        if let Some(entry) = entries.get_mut(key) {
            entry.shadow = None;
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries.
    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const EPOCH: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

    fn canonical(kind: &str, params: Vec<Value>) -> CanonicalKey {
        QueryKey::new(kind, params).canonical().expect("canonical key")
    }

    fn populate(store: &CacheStore, key: &CanonicalKey, value: Value) {
        store.set(
            key,
            value,
            Duration::from_secs(30),
            Duration::from_secs(300),
            EPOCH,
        );
    }

    #[test]
    fn set_then_get_is_fresh() {
        let store = CacheStore::new();
        let key = canonical("comments", vec![json!("post-1"), json!(1), json!(20)]);

        assert!(store.get(&key, EPOCH).is_none());

        populate(&store, &key, json!([{"id": 1}]));

        let entry = store.get(&key, EPOCH).expect("cached entry");
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(entry.value, Some(json!([{"id": 1}])));
        assert!(entry.is_fresh(EPOCH + time::Duration::seconds(10)));
        assert!(entry.stale_at >= entry.fetched_at);
    }

    #[test]
    fn set_overwrites_and_bumps_revision() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);

        populate(&store, &key, json!(1));
        let first = store.entry(&key).expect("first").revision;
        populate(&store, &key, json!(2));
        let second = store.entry(&key).expect("second");

        assert!(second.revision > first);
        assert_eq!(second.value, Some(json!(2)));
        assert_eq!(second.status, EntryStatus::Fresh);
    }

    #[test]
    fn mark_stale_cascades_to_descendants_only() {
        let store = CacheStore::new();
        let page1 = canonical("comments", vec![json!("post-1"), json!(1)]);
        let page2 = canonical("comments", vec![json!("post-1"), json!(2)]);
        let other = canonical("comments", vec![json!("post-2"), json!(1)]);

        populate(&store, &page1, json!("a"));
        populate(&store, &page2, json!("b"));
        populate(&store, &other, json!("c"));

        let prefix = QueryKey::new("comments", vec![json!("post-1")]);
        let hits = store.mark_stale(&prefix, 7);

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.transitioned));
        assert_eq!(store.entry(&page1).expect("page1").status, EntryStatus::Stale);
        assert_eq!(store.entry(&page1).expect("page1").invalidated_epoch, 7);
        assert_eq!(store.entry(&other).expect("other").status, EntryStatus::Fresh);

        // Values are retained for optimistic display.
        assert_eq!(store.entry(&page1).expect("page1").value, Some(json!("a")));
    }

    #[test]
    fn mark_stale_on_stale_entry_does_not_bump_revision() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        let prefix = QueryKey::bare("feed");
        store.mark_stale(&prefix, 1);
        let first = store.entry(&key).expect("entry").revision;

        let hits = store.mark_stale(&prefix, 2);
        assert!(!hits[0].transitioned);
        assert_eq!(store.entry(&key).expect("entry").revision, first);
        // The superseding epoch still advances.
        assert_eq!(store.entry(&key).expect("entry").invalidated_epoch, 2);
    }

    #[test]
    fn invalidate_clears_value_and_is_idempotent() {
        let store = CacheStore::new();
        let key = canonical("comments", vec![json!("post-1"), json!(1)]);
        populate(&store, &key, json!("a"));

        let prefix = QueryKey::new("comments", vec![json!("post-1")]);
        let hits = store.invalidate(&prefix, 3);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].transitioned);

        // Servable view reports absent; the raw entry remains for epoch checks.
        assert!(store.get(&key, EPOCH).is_none());
        let entry = store.entry(&key).expect("raw entry");
        assert_eq!(entry.status, EntryStatus::Invalidated);
        assert_eq!(entry.value, None);

        // Second invalidation is a no-op transition.
        let hits = store.invalidate(&prefix, 4);
        assert_eq!(hits.len(), 1);
        assert!(!hits[0].transitioned);
    }

    #[test]
    fn unknown_prefix_is_a_no_op() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        let prefix = QueryKey::bare("posts");
        assert!(store.mark_stale(&prefix, 1).is_empty());
        assert!(store.invalidate(&prefix, 2).is_empty());
        assert_eq!(store.entry(&key).expect("entry").status, EntryStatus::Fresh);
    }

    #[test]
    fn get_slides_retention_deadline() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        let later = EPOCH + time::Duration::seconds(100);
        store.get(&key, later);

        let entry = store.entry(&key).expect("entry");
        assert_eq!(entry.gc_at, later + Duration::from_secs(300));
    }

    #[test]
    fn evict_expired_honors_subscriptions() {
        let store = CacheStore::new();
        let watched = canonical("feed", vec![]);
        let unwatched = canonical("comments", vec![json!("post-1"), json!(1)]);
        populate(&store, &watched, json!(1));
        populate(&store, &unwatched, json!(2));

        let past_retention = EPOCH + time::Duration::seconds(301);
        let mut subscribed = HashSet::new();
        subscribed.insert(watched.clone());

        let evicted = store.evict_expired(past_retention, &subscribed);

        assert_eq!(evicted, vec![unwatched.clone()]);
        assert!(store.entry(&unwatched).is_none());
        assert!(store.entry(&watched).is_some());
    }

    #[test]
    fn evict_expired_keeps_entries_within_retention() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        let evicted = store.evict_expired(EPOCH + time::Duration::seconds(299), &HashSet::new());
        assert!(evicted.is_empty());
        assert!(store.entry(&key).is_some());
    }

    #[test]
    fn optimistic_apply_and_rollback_restores_pre_mutation_state() {
        let store = CacheStore::new();
        let key = canonical("comments", vec![json!("post-1"), json!(1)]);
        populate(&store, &key, json!(["original"]));

        store.apply_optimistic(&key, json!(["original", "hi"]), EPOCH, Duration::from_secs(300));

        let entry = store.entry(&key).expect("entry");
        assert_eq!(entry.status, EntryStatus::Stale);
        assert_eq!(entry.value, Some(json!(["original", "hi"])));
        assert!(entry.has_optimistic());

        store.rollback_optimistic(&key).expect("rollback");
        let entry = store.entry(&key).expect("entry");
        assert_eq!(entry.status, EntryStatus::Fresh);
        assert_eq!(entry.value, Some(json!(["original"])));
        assert!(!entry.has_optimistic());
    }

    #[test]
    fn double_optimistic_apply_keeps_original_shadow() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        store.apply_optimistic(&key, json!(2), EPOCH, Duration::from_secs(300));
        store.apply_optimistic(&key, json!(3), EPOCH, Duration::from_secs(300));

        store.rollback_optimistic(&key).expect("rollback");
        assert_eq!(store.entry(&key).expect("entry").value, Some(json!(1)));
    }

    #[test]
    fn commit_optimistic_clears_shadow_keeps_value() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        store.apply_optimistic(&key, json!(2), EPOCH, Duration::from_secs(300));
        store.commit_optimistic(&key);

        let entry = store.entry(&key).expect("entry");
        assert!(!entry.has_optimistic());
        assert_eq!(entry.value, Some(json!(2)));
    }

    #[test]
    fn rollback_without_shadow_is_none() {
        let store = CacheStore::new();
        let key = canonical("feed", vec![]);
        populate(&store, &key, json!(1));

        assert!(store.rollback_optimistic(&key).is_none());
    }
}
