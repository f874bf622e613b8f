use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Query parameters for an upstream resource.
pub type Params = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Rate-limit classes
// ---------------------------------------------------------------------------

/// Live price data (short windows, strict budget).
pub const CLASS_PRICE: &str = "price";
/// Reference data that rarely changes.
pub const CLASS_STATIC: &str = "static";
/// Everything else.
pub const CLASS_GENERAL: &str = "general";

// ---------------------------------------------------------------------------
// Cache Key
// ---------------------------------------------------------------------------

/// Deterministic cache key for an `(endpoint, params)` pair.
///
/// Parameter names are sorted lexicographically and rendered as
/// `name=JSON(value)` joined by `&`, so two requests carrying the same
/// parameters in a different insertion order share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<I, K, V>(endpoint: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<Value>,
    {
        let mut pairs: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.borrow().to_string()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        if query.is_empty() {
            Self(endpoint.to_string())
        } else {
            Self(format!("{}?{}", endpoint, query))
        }
    }

    /// Key for an endpoint with no parameters.
    pub fn bare(endpoint: &str) -> Self {
        Self(endpoint.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Identifier of one viewer connection on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
