use crate::models::Params;
use async_trait::async_trait;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised anywhere in the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Upstream request timed out: {0}")]
    UpstreamTimeout(String),
    #[error("Upstream rate limited request: {0}")]
    UpstreamRateLimited(String),
    #[error("Local rate limit exhausted for class {0}")]
    LocalRateLimited(String),
    #[error("Upstream unavailable and nothing cached for {0}")]
    UpstreamUnavailable(String),
    #[error("Upstream request failed: {0}")]
    UpstreamFailed(String),
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Gave up after {0} reconnect attempts")]
    MaxRetriesExceeded(u32),
}

impl SyncError {
    /// Stable machine-readable code used in error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::UpstreamTimeout(_) => "upstream_timeout",
            SyncError::UpstreamRateLimited(_) => "upstream_rate_limited",
            SyncError::LocalRateLimited(_) => "local_rate_limited",
            SyncError::UpstreamUnavailable(_) => "upstream_unavailable",
            SyncError::UpstreamFailed(_) => "upstream_failed",
            SyncError::UnknownTopic(_) => "unknown_topic",
            SyncError::ConnectionLost(_) => "connection_lost",
            SyncError::MaxRetriesExceeded(_) => "max_retries_exceeded",
        }
    }

    /// Whether the upstream client recovers from this error with a cached
    /// value instead of surfacing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::UpstreamTimeout(_)
                | SyncError::UpstreamRateLimited(_)
                | SyncError::LocalRateLimited(_)
                | SyncError::UpstreamFailed(_)
        )
    }

    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Upstream Trait
// ---------------------------------------------------------------------------

/// A remote price API returning opaque JSON per resource.
///
/// Implementations perform exactly one network call per invocation and map
/// transport failures onto [`SyncError::UpstreamTimeout`],
/// [`SyncError::UpstreamRateLimited`] and [`SyncError::UpstreamFailed`].
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get(&self, resource: &str, params: &Params) -> Result<Value, SyncError>;
}
