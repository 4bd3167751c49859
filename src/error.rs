//! Error types for the query engine.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced while canonicalizing a query key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A key parameter is not a JSON primitive (or is a non-finite float).
    #[error("key parameter at index {index} is not serializable: {reason}")]
    Unserializable { index: usize, reason: &'static str },
    /// The key kind is empty.
    #[error("key kind must not be empty")]
    EmptyKind,
}

/// A failed read from the underlying data source.
///
/// Wraps the collaborator's error as a message so the settle result can be
/// cloned across every waiter sharing the same in-flight fetch. The engine
/// never retries; a failed fetch leaves previously cached data untouched.
#[derive(Debug, Clone, Error)]
#[error("fetch failed: {message}")]
pub struct FetchError {
    message: Arc<str>,
}

impl FetchError {
    pub fn new(source: impl fmt::Display) -> Self {
        Self {
            message: source.to_string().into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A read that could not produce a snapshot.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// A failed write, or a write rejected by the coordinator's concurrency policy.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    /// The underlying write failed. No invalidation was applied.
    #[error("mutation '{name}' failed: {message}")]
    Failed { name: Arc<str>, message: Arc<str> },
    /// Another run of the same mutation is in progress and the descriptor's
    /// policy is `Reject`.
    #[error("mutation '{name}' is already running")]
    AlreadyRunning { name: Arc<str> },
}

impl MutationError {
    pub fn failed(name: &str, source: impl fmt::Display) -> Self {
        Self::Failed {
            name: name.into(),
            message: source.to_string().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_preserves_message() {
        let err = FetchError::new("connection reset");
        assert_eq!(err.message(), "connection reset");
        assert_eq!(err.to_string(), "fetch failed: connection reset");
    }

    #[test]
    fn fetch_error_is_cheaply_clonable() {
        let err = FetchError::new("timeout");
        let clone = err.clone();
        assert_eq!(err.message(), clone.message());
    }

    #[test]
    fn mutation_error_display() {
        let err = MutationError::failed("create_comment", "constraint violation");
        assert_eq!(
            err.to_string(),
            "mutation 'create_comment' failed: constraint violation"
        );

        let rejected = MutationError::AlreadyRunning {
            name: "create_comment".into(),
        };
        assert_eq!(
            rejected.to_string(),
            "mutation 'create_comment' is already running"
        );
    }
}
