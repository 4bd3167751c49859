//! requery — client-side query cache and mutation coordination.
//!
//! Caches the results of asynchronous reads keyed by semantic identity,
//! tracks per-entry freshness and retention windows, deduplicates concurrent
//! identical reads, and cascades invalidation from successful writes across
//! a declared prefix-based dependency map.
//!
//! ## Shape
//!
//! - [`QueryKey`]: structured key (entity kind + ordered primitive params)
//!   with element-wise prefix matching for cascades.
//! - [`CacheStore`]: single owner of all cached entries and their
//!   staleness/retention state.
//! - [`InFlightRegistry`]: at most one pending fetch per key; concurrent
//!   requests share the settle.
//! - [`QueryEngine`]: the constructed instance tying it together — the read
//!   contract ([`QueryEngine::subscribe`], [`QueryEngine::fetch`]) and the
//!   mutation contract ([`QueryEngine::mutation`]).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use requery::{EngineConfig, Invalidation, MutationDescriptor, QueryEngine, QueryKey};
//! use serde_json::json;
//!
//! let engine = QueryEngine::new(EngineConfig::default());
//!
//! let comments = QueryKey::new("comments", vec![json!("post-1"), json!(1), json!(20)]);
//! let subscription = engine
//!     .subscribe(&comments, Arc::new(|| Box::pin(list_comments("post-1", 1, 20))),
//!                engine.default_policy())
//!     .await?;
//!
//! let create_comment = engine.mutation(
//!     MutationDescriptor::new("create_comment", |input| Box::pin(insert_comment(input)))
//!         .invalidates(|input, _output| {
//!             let post_id = input["postId"].clone();
//!             vec![
//!                 Invalidation::mark_stale(QueryKey::new("comments", vec![post_id])),
//!                 Invalidation::mark_stale(QueryKey::bare("feed")),
//!             ]
//!         }),
//! );
//! create_comment.run(json!({"postId": "post-1", "body": "hi"})).await?;
//! ```

mod clock;
mod config;
mod engine;
mod entry;
mod error;
mod events;
mod inflight;
mod key;
mod lock;
mod mutation;
mod scheduler;
mod store;
mod subscribers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{FetchFn, QueryEngine, QuerySnapshot, Subscription};
pub use entry::{CacheEntry, EntryStatus};
pub use error::{FetchError, KeyError, MutationError, QueryError};
pub use events::{EngineEvent, Epoch, EventKind, EventLog};
pub use inflight::{FetchFuture, FetchTicket, InFlightRegistry, SharedFetch};
pub use key::{CanonicalKey, QueryKey};
pub use mutation::{
    ConcurrencyPolicy, Invalidation, InvalidationScope, MutationDescriptor, MutationFuture,
    MutationHandle, MutationState, OptimisticUpdate,
};
pub use scheduler::{QueryPolicy, ReadDisposition, ReadMode, disposition};
pub use store::{CacheStore, CascadeHit};
pub use subscribers::{QueryUpdate, SubscriberHub, SubscriptionId};
