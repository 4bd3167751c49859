//! Query key definitions.
//!
//! A `QueryKey` identifies a cached read by an entity kind plus an ordered
//! list of primitive parameters, e.g. `("comments", [post_id, page, limit])`.
//! Keys are structured tuples with explicit prefix comparison; invalidation
//! cascades match on leading sub-sequences, never on string concatenation,
//! so `("comments", [1])` can never cross-match `("comments", [10])`.

use std::fmt;

use serde_json::Value;

use crate::error::KeyError;

/// Structured identifier for a cached read.
///
/// Two keys are equal iff kind and all params compare equal in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    kind: String,
    params: Vec<Value>,
}

impl QueryKey {
    /// Build a key from a kind and ordered params.
    ///
    /// Params are validated lazily by [`QueryKey::canonical`]; construction
    /// itself never fails so key literals stay ergonomic at call sites.
    pub fn new(kind: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    /// A key with no params, e.g. `("feed", [])`.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Canonicalize into the deterministic string form used as the store key.
    ///
    /// Fails with [`KeyError::Unserializable`] if any param is not a JSON
    /// primitive (arrays, objects) or is a non-finite float, and with
    /// [`KeyError::EmptyKind`] for an empty kind.
    pub fn canonical(&self) -> Result<CanonicalKey, KeyError> {
        if self.kind.is_empty() {
            return Err(KeyError::EmptyKind);
        }
        for (index, param) in self.params.iter().enumerate() {
            validate_param(index, param)?;
        }

        // Serialize as the JSON array [kind, params...]; serde_json escaping
        // keeps element boundaries unambiguous.
        let mut tuple = Vec::with_capacity(self.params.len() + 1);
        tuple.push(Value::String(self.kind.clone()));
        tuple.extend(self.params.iter().cloned());
        let serialized =
            serde_json::to_string(&tuple).map_err(|_| KeyError::Unserializable {
                index: 0,
                reason: "tuple serialization failed",
            })?;

        Ok(CanonicalKey {
            serialized,
            key: self.clone(),
        })
    }

    /// True iff `full`'s tuple begins with this key's tuple element-wise.
    ///
    /// Every key is a prefix of itself.
    pub fn is_prefix_of(&self, full: &QueryKey) -> bool {
        self.kind == full.kind
            && self.params.len() <= full.params.len()
            && self.params.iter().zip(&full.params).all(|(a, b)| a == b)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")")
    }
}

fn validate_param(index: usize, param: &Value) -> Result<(), KeyError> {
    match param {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => {
            // serde_json rejects NaN/inf at construction for f64 numbers, but
            // arbitrary-precision builds can smuggle them through; reject any
            // number that does not round-trip as a finite value.
            if n.is_i64() || n.is_u64() || n.as_f64().is_some_and(f64::is_finite) {
                Ok(())
            } else {
                Err(KeyError::Unserializable {
                    index,
                    reason: "non-finite number",
                })
            }
        }
        Value::Array(_) => Err(KeyError::Unserializable {
            index,
            reason: "nested array",
        }),
        Value::Object(_) => Err(KeyError::Unserializable {
            index,
            reason: "nested object",
        }),
    }
}

/// The canonical string form of a validated key.
///
/// Used as the map key in the store, in-flight registry, and subscriber hub.
/// Retains the parsed tuple so prefix checks stay structural.
#[derive(Debug, Clone)]
pub struct CanonicalKey {
    serialized: String,
    key: QueryKey,
}

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.key
    }
}

impl PartialEq for CanonicalKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for CanonicalKey {}

impl std::hash::Hash for CanonicalKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}
