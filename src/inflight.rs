//! In-flight fetch registry.
//!
//! Holds at most one pending fetch per canonical key. Concurrent requests
//! for the same key share the pending result instead of issuing duplicate
//! fetches. A registration is removed from inside the wrapped future, after
//! the underlying fetch settles and before any waiter resumes, so a request
//! arriving during teardown either joins the settled future or starts a
//! clean replacement; removal is guarded by request id so a replacement
//! registered after `cancel` is never torn down by the superseded fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::FetchError;
use crate::events::Epoch;
use crate::key::{CanonicalKey, QueryKey};
use crate::lock::mutex_lock;

const SOURCE: &str = "requery::inflight";
const METRIC_FETCH_DEDUP_TOTAL: &str = "requery_fetch_dedup_total";

/// A boxed fetch supplied by a collaborator.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// A pending fetch that any number of waiters may await.
pub type SharedFetch = Shared<FetchFuture>;

/// Handle returned by [`InFlightRegistry::get_or_start`].
pub struct FetchTicket {
    pub shared: SharedFetch,
    /// Epoch at which the underlying fetch started. Compared against the
    /// entry's invalidation epoch on settle.
    pub started_epoch: Epoch,
    /// Set when a mutation cancels this fetch; its settle must not be
    /// applied to the store.
    pub superseded: Arc<AtomicBool>,
    /// Shared latch ensuring one settle is applied to the store exactly once
    /// no matter how many waiters resume from it.
    pub committed: Arc<AtomicBool>,
    /// True if this call started the fetch, false if it joined an existing one.
    pub started: bool,
}

impl FetchTicket {
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    /// Claim the right to apply this settle. True exactly once per fetch,
    /// across every ticket sharing it.
    pub fn claim_commit(&self) -> bool {
        !self.committed.swap(true, Ordering::SeqCst)
    }
}

struct InFlightRequest {
    shared: SharedFetch,
    request_id: Uuid,
    started_epoch: Epoch,
    superseded: Arc<AtomicBool>,
    committed: Arc<AtomicBool>,
}

/// Registry of pending fetches, keyed by canonical key.
///
/// Never stores settled values; a request exists only for the duration of
/// one fetch.
pub struct InFlightRegistry {
    requests: Mutex<HashMap<CanonicalKey, InFlightRequest>>,
}

impl InFlightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(HashMap::new()),
        })
    }

    /// Join the pending fetch for `key`, or start one via `make`.
    pub fn get_or_start(
        self: &Arc<Self>,
        key: &CanonicalKey,
        started_epoch: Epoch,
        make: impl FnOnce() -> FetchFuture,
    ) -> FetchTicket {
        let mut requests = mutex_lock(&self.requests, SOURCE, "get_or_start");

        if let Some(request) = requests.get(key) {
            counter!(METRIC_FETCH_DEDUP_TOTAL).increment(1);
            debug!(key = %key, "Joined in-flight fetch");
            return FetchTicket {
                shared: request.shared.clone(),
                started_epoch: request.started_epoch,
                superseded: request.superseded.clone(),
                committed: request.committed.clone(),
                started: false,
            };
        }

        let request_id = Uuid::new_v4();
        let superseded = Arc::new(AtomicBool::new(false));
        let committed = Arc::new(AtomicBool::new(false));
        let registry = Arc::downgrade(self);
        let teardown_key = key.clone();
        let inner = make();
        let wrapped: FetchFuture = Box::pin(async move {
            let result = inner.await;
            // Settle first, deregister second: a waiter resuming here must
            // never find a stale registration for a fetch that has already
            // produced its result.
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_current(&teardown_key, request_id);
            }
            result
        });
        let shared = wrapped.shared();

        requests.insert(
            key.clone(),
            InFlightRequest {
                shared: shared.clone(),
                request_id,
                started_epoch,
                superseded: superseded.clone(),
                committed: committed.clone(),
            },
        );

        FetchTicket {
            shared,
            started_epoch,
            superseded,
            committed,
            started: true,
        }
    }

    /// Best-effort cancellation: the underlying fetch keeps running, but its
    /// settle is flagged for discard and the registration is removed so the
    /// next request starts a fresh fetch. Returns true if a request existed.
    pub fn cancel(&self, key: &CanonicalKey) -> bool {
        let mut requests = mutex_lock(&self.requests, SOURCE, "cancel");
        match requests.remove(key) {
            Some(request) => {
                request.superseded.store(true, Ordering::SeqCst);
                debug!(key = %key, "Cancelled in-flight fetch");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending fetch whose key falls under `prefix`.
    pub fn cancel_matching(&self, prefix: &QueryKey) -> Vec<CanonicalKey> {
        let mut requests = mutex_lock(&self.requests, SOURCE, "cancel_matching");
        let matching: Vec<CanonicalKey> = requests
            .keys()
            .filter(|key| prefix.is_prefix_of(key.query_key()))
            .cloned()
            .collect();
        for key in &matching {
            if let Some(request) = requests.remove(key) {
                request.superseded.store(true, Ordering::SeqCst);
            }
        }
        matching
    }

    /// Number of pending fetches.
    pub fn len(&self) -> usize {
        mutex_lock(&self.requests, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_if_current(&self, key: &CanonicalKey, request_id: Uuid) {
        let mut requests = mutex_lock(&self.requests, SOURCE, "remove_if_current");
        if requests
            .get(key)
            .is_some_and(|request| request.request_id == request_id)
        {
            requests.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;

    fn key(kind: &str) -> CanonicalKey {
        QueryKey::bare(kind).canonical().expect("canonical key")
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let registry = InFlightRegistry::new();
        let k = key("feed");
        let executions = Arc::new(AtomicUsize::new(0));

        let make = |executions: Arc<AtomicUsize>| {
            move || -> FetchFuture {
                Box::pin(async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("data"))
                })
            }
        };

        let first = registry.get_or_start(&k, 0, make(executions.clone()));
        let second = registry.get_or_start(&k, 0, make(executions.clone()));
        assert!(first.started);
        assert!(!second.started);

        let (a, b) = tokio::join!(first.shared, second.shared);
        assert_eq!(a.expect("first result"), json!("data"));
        assert_eq!(b.expect("second result"), json!("data"));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_is_removed_after_settle() {
        let registry = InFlightRegistry::new();
        let k = key("feed");

        let ticket = registry.get_or_start(&k, 0, || Box::pin(async { Ok(json!(1)) }));
        assert_eq!(registry.len(), 1);

        ticket.shared.await.expect("settle");
        assert!(registry.is_empty());

        // A new request starts a fresh fetch rather than joining a settled one.
        let next = registry.get_or_start(&k, 1, || Box::pin(async { Ok(json!(2)) }));
        assert!(next.started);
        assert_eq!(next.shared.await.expect("second settle"), json!(2));
    }

    #[tokio::test]
    async fn failed_fetch_also_deregisters() {
        let registry = InFlightRegistry::new();
        let k = key("feed");

        let ticket = registry.get_or_start(&k, 0, || {
            Box::pin(async { Err(FetchError::new("boom")) })
        });
        let result = ticket.shared.await;
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_flags_ticket_and_allows_replacement() {
        let registry = InFlightRegistry::new();
        let k = key("comments");
        let (release, gate) = oneshot::channel::<()>();

        let slow = registry.get_or_start(&k, 0, || {
            Box::pin(async move {
                let _ = gate.await;
                Ok(json!("old"))
            })
        });
        assert!(!slow.is_superseded());

        assert!(registry.cancel(&k));
        assert!(slow.is_superseded());
        assert!(registry.is_empty());

        // The replacement registers independently of the superseded fetch.
        let fast = registry.get_or_start(&k, 5, || Box::pin(async { Ok(json!("new")) }));
        assert!(fast.started);
        assert_eq!(fast.shared.await.expect("fast settle"), json!("new"));

        // The superseded fetch still settles; its teardown must not remove a
        // later registration (none here, but it must not panic either).
        release.send(()).expect("release gate");
        assert_eq!(slow.shared.clone().await.expect("slow settle"), json!("old"));
        assert!(slow.is_superseded());
    }

    #[tokio::test]
    async fn cancel_matching_uses_structural_prefixes() {
        let registry = InFlightRegistry::new();
        let post1 = QueryKey::new("comments", vec![json!("post-1"), json!(1)])
            .canonical()
            .expect("post1");
        let post2 = QueryKey::new("comments", vec![json!("post-2"), json!(1)])
            .canonical()
            .expect("post2");

        let (_g1, gate1) = oneshot::channel::<()>();
        let (_g2, gate2) = oneshot::channel::<()>();
        registry.get_or_start(&post1, 0, || {
            Box::pin(async move {
                let _ = gate1.await;
                Ok(json!(1))
            })
        });
        registry.get_or_start(&post2, 0, || {
            Box::pin(async move {
                let _ = gate2.await;
                Ok(json!(2))
            })
        });

        let prefix = QueryKey::new("comments", vec![json!("post-1")]);
        let cancelled = registry.cancel_matching(&prefix);

        assert_eq!(cancelled, vec![post1]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_false() {
        let registry = InFlightRegistry::new();
        assert!(!registry.cancel(&key("nothing")));
    }
}
