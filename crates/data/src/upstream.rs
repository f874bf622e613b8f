use crate::cache::Cache;
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use coinpulse_core::*;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// HTTP Upstream
// ---------------------------------------------------------------------------

/// Plain HTTP GET against a JSON price API (Coinbase v2 by default).
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::UpstreamFailed(format!("HTTP client init failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}{}", self.base_url, resource)
    }
}

/// Render a JSON parameter as a query-string value. Strings go out bare,
/// everything else as its JSON text.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn get(&self, resource: &str, params: &Params) -> Result<Value, SyncError> {
        let url = self.url(resource);
        let query: Vec<(&str, String)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), query_value(v)))
            .collect();

        let response = self
            .client
            .get(&url)
            .query(&query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::UpstreamTimeout(url.clone())
                } else {
                    SyncError::UpstreamFailed(format!("{}: {}", url, e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::UpstreamRateLimited(url));
        }
        if !status.is_success() {
            return Err(SyncError::UpstreamFailed(format!("{} returned {}", url, status)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::UpstreamFailed(format!("{}: malformed body: {}", url, e)))
    }
}

// ---------------------------------------------------------------------------
// Cached Upstream Client
// ---------------------------------------------------------------------------

/// Fetches upstream resources through the cache and rate limiter.
///
/// Order of operations per call: fresh cache hit, then rate-limit check, then
/// one bounded network call. Any failure after a cache miss (local denial,
/// upstream 429, timeout, bad response) falls back to the last cached value
/// for the key, stale or not, and only reports
/// [`SyncError::UpstreamUnavailable`] when nothing was ever cached.
pub struct UpstreamClient {
    upstream: Arc<dyn Upstream>,
    cache: Arc<Cache>,
    limiter: Arc<RateLimiter>,
    config: Arc<CoinpulseConfig>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        cache: Arc<Cache>,
        limiter: Arc<RateLimiter>,
        config: Arc<CoinpulseConfig>,
    ) -> Self {
        let timeout = Duration::from_secs(config.upstream.timeout_secs);
        Self {
            upstream,
            cache,
            limiter,
            config,
            timeout,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub async fn fetch(&self, resource: &str, params: &Params) -> Result<Value, SyncError> {
        let key = CacheKey::new(resource, params);
        if let Some(value) = self.cache.get(&key) {
            debug!(key = %key, "Cache hit");
            return Ok(value);
        }
        debug!(key = %key, "Cache miss");

        let policy = self.config.resource_policy(resource);
        if !self.limiter.try_acquire(&policy.class) {
            return self.grace_fallback(&key, SyncError::LocalRateLimited(policy.class));
        }

        let outcome = tokio::time::timeout(self.timeout, self.upstream.get(resource, params))
            .await
            .unwrap_or_else(|_| Err(SyncError::UpstreamTimeout(resource.to_string())));

        match outcome {
            Ok(value) => {
                self.cache.set(key, value.clone(), policy.ttl);
                Ok(value)
            }
            Err(err) => self.grace_fallback(&key, err),
        }
    }

    /// Last value stored for the resource, fresh or stale, without touching
    /// the network.
    pub fn cached(&self, resource: &str, params: &Params) -> Option<Value> {
        self.cache.get_stale(&CacheKey::new(resource, params))
    }

    fn grace_fallback(&self, key: &CacheKey, cause: SyncError) -> Result<Value, SyncError> {
        match self.cache.get_stale(key) {
            Some(value) => {
                warn!(key = %key, cause = %cause, "Serving stale cache entry");
                Ok(value)
            }
            None => {
                warn!(key = %key, cause = %cause, "No cached fallback available");
                Err(SyncError::UpstreamUnavailable(key.to_string()))
            }
        }
    }
}
