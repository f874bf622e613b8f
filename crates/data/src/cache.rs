use coinpulse_core::CacheKey;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory key/value store with per-entry expiration.
///
/// Expiry is lazy: `get` treats an entry as absent from the instant its
/// TTL elapses. Expired entries remain reachable through [`Cache::get_stale`]
/// until [`Cache::sweep`] reclaims them, which is what the upstream client's
/// grace fallback relies on.
pub struct Cache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    shutdown: CancellationToken,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the value only while `now < expires_at`.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Returns the last stored value whether or not it has expired.
    pub fn get_stale(&self, key: &CacheKey) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn set(&self, key: CacheKey, value: Value, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cached value");
        self.entries
            .write()
            .insert(key, CacheEntry { value, expires_at });
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run [`Cache::sweep`] every `period` until [`Cache::close`] is called
    /// or the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
        })
    }

    /// Stop the background sweeper and drop all entries.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.clear();
        info!("Cache closed");
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
