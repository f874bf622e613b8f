use crate::models::{Params, CLASS_GENERAL, CLASS_PRICE, CLASS_STATIC};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for server and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinpulseConfig {
    /// Address the hub listens on.
    pub bind: String,
    pub upstream: UpstreamConfig,
    /// Rate-limit budget per class. Classes set in a file override the
    /// built-in budgets one by one; unlisted classes keep their defaults.
    #[serde(deserialize_with = "merge_rate_limits")]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Resource policies, checked in order after an exact match.
    pub resources: Vec<ResourceConfig>,
    /// TTL for resources that match no policy.
    pub default_ttl_secs: u64,
    pub topics: BTreeMap<String, TopicConfig>,
    pub hub: HubConfig,
    pub cache: CacheConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Network timeout per request, independent of cache TTLs.
    pub timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Cache TTL and rate-limit class for resources under `prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub prefix: String,
    pub class: String,
    pub ttl_secs: u64,
}

/// Resolved policy for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub class: String,
    pub ttl: Duration,
}

/// A named upstream resource that viewers can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub resource: String,
    #[serde(default)]
    pub params: Params,
    pub refresh_interval_secs: u64,
}

impl TopicConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub heartbeat_interval_secs: u64,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Period of the background expiry sweep. Expired entries stay
    /// available to the stale fallback until the next sweep.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub max_retries: u32,
    pub reconnect_delay_ms: u64,
    /// Data older than this is reported as stale.
    pub stale_after_secs: u64,
    /// Silence from the server longer than this drops the socket.
    pub heartbeat_timeout_secs: u64,
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coinbase.com/v2".to_string(),
            timeout_secs: 15,
            user_agent: concat!("coinpulse/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            outbound_buffer: 64,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4000/ws".to_string(),
            max_retries: 5,
            reconnect_delay_ms: 3000,
            stale_after_secs: 30,
            heartbeat_timeout_secs: 60,
        }
    }
}

fn default_rate_limits() -> BTreeMap<String, RateLimitConfig> {
    let mut rate_limits = BTreeMap::new();
    rate_limits.insert(
        CLASS_PRICE.to_string(),
        RateLimitConfig {
            window_ms: 30_000,
            max_requests: 20,
        },
    );
    rate_limits.insert(
        CLASS_STATIC.to_string(),
        RateLimitConfig {
            window_ms: 60_000,
            max_requests: 120,
        },
    );
    rate_limits.insert(
        CLASS_GENERAL.to_string(),
        RateLimitConfig {
            window_ms: 60_000,
            max_requests: 60,
        },
    );
    rate_limits
}

fn merge_rate_limits<'de, D>(deserializer: D) -> Result<BTreeMap<String, RateLimitConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<String, RateLimitConfig>::deserialize(deserializer)?;
    let mut limits = default_rate_limits();
    limits.extend(overrides);
    Ok(limits)
}

impl Default for CoinpulseConfig {
    fn default() -> Self {
        let rate_limits = default_rate_limits();

        let resources = vec![
            ResourceConfig {
                prefix: "/prices".to_string(),
                class: CLASS_PRICE.to_string(),
                ttl_secs: 10,
            },
            ResourceConfig {
                prefix: "/exchange-rates".to_string(),
                class: CLASS_GENERAL.to_string(),
                ttl_secs: 30,
            },
            ResourceConfig {
                prefix: "/currencies".to_string(),
                class: CLASS_STATIC.to_string(),
                ttl_secs: 300,
            },
        ];

        let mut topics = BTreeMap::new();
        topics.insert(
            "solana-price".to_string(),
            TopicConfig {
                resource: "/prices/SOL-USD/spot".to_string(),
                params: Params::new(),
                refresh_interval_secs: 10,
            },
        );
        topics.insert(
            "bitcoin-price".to_string(),
            TopicConfig {
                resource: "/prices/BTC-USD/spot".to_string(),
                params: Params::new(),
                refresh_interval_secs: 10,
            },
        );
        let mut rate_params = Params::new();
        rate_params.insert("currency".to_string(), json!("USD"));
        topics.insert(
            "exchange-rates".to_string(),
            TopicConfig {
                resource: "/exchange-rates".to_string(),
                params: rate_params,
                refresh_interval_secs: 30,
            },
        );

        Self {
            bind: "0.0.0.0:4000".to_string(),
            upstream: UpstreamConfig::default(),
            rate_limits,
            resources,
            default_ttl_secs: 60,
            topics,
            hub: HubConfig::default(),
            cache: CacheConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & lookup
// ---------------------------------------------------------------------------

impl CoinpulseConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "upstream timeout must be non-zero".to_string(),
            ));
        }
        for (class, limit) in &self.rate_limits {
            if limit.window_ms == 0 || limit.max_requests == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate limit class '{}' needs a non-zero window and max",
                    class
                )));
            }
        }
        for (name, topic) in &self.topics {
            if topic.refresh_interval_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "topic '{}' needs a non-zero refresh interval",
                    name
                )));
            }
        }
        if self.hub.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        if self.client.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "client heartbeat timeout must be non-zero".to_string(),
            ));
        }
        if self.hub.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound buffer must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the cache TTL and rate-limit class of a resource: exact match,
    /// then the first matching prefix, then the defaults.
    pub fn resource_policy(&self, resource: &str) -> ResourcePolicy {
        let matched = self
            .resources
            .iter()
            .find(|r| r.prefix == resource)
            .or_else(|| self.resources.iter().find(|r| resource.starts_with(&r.prefix)));

        match matched {
            Some(r) => ResourcePolicy {
                class: r.class.clone(),
                ttl: Duration::from_secs(r.ttl_secs),
            },
            None => ResourcePolicy {
                class: CLASS_GENERAL.to_string(),
                ttl: Duration::from_secs(self.default_ttl_secs),
            },
        }
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoinpulseConfig::default();
        config.validate().unwrap();
        assert_eq!(config.client.max_retries, 5);
        assert_eq!(config.hub.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.topic("solana-price").is_some());
    }

    #[test]
    fn test_resource_policy_resolution() {
        let config = CoinpulseConfig::default();

        let price = config.resource_policy("/prices/SOL-USD/spot");
        assert_eq!(price.class, CLASS_PRICE);
        assert_eq!(price.ttl, Duration::from_secs(10));

        let static_data = config.resource_policy("/currencies");
        assert_eq!(static_data.class, CLASS_STATIC);
        assert_eq!(static_data.ttl, Duration::from_secs(300));

        let unknown = config.resource_policy("/time");
        assert_eq!(unknown.class, CLASS_GENERAL);
        assert_eq!(unknown.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_exact_match_beats_prefix() {
        let mut config = CoinpulseConfig::default();
        config.resources.push(ResourceConfig {
            prefix: "/prices/BTC-USD/historic".to_string(),
            class: CLASS_STATIC.to_string(),
            ttl_secs: 600,
        });
        let policy = config.resource_policy("/prices/BTC-USD/historic");
        assert_eq!(policy.class, CLASS_STATIC);
        assert_eq!(policy.ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_from_toml() {
        let raw = r#"
            bind = "127.0.0.1:9000"

            [upstream]
            base_url = "http://localhost:8080"
            timeout_secs = 5

            [rate_limits.price]
            window_ms = 1000
            max_requests = 3

            [topics.solana-price]
            resource = "/prices/SOL-USD/spot"
            refresh_interval_secs = 10

            [topics.rates]
            resource = "/exchange-rates"
            refresh_interval_secs = 30
            params = { currency = "EUR" }

            [client]
            max_retries = 2
        "#;
        let config = CoinpulseConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.upstream.timeout_secs, 5);
        assert_eq!(config.rate_limits["price"].window(), Duration::from_secs(1));
        assert_eq!(config.rate_limits["price"].max_requests, 3);
        assert_eq!(config.topics["rates"].params["currency"], "EUR");
        assert_eq!(config.client.max_retries, 2);
        assert_eq!(config.client.reconnect_delay_ms, 3000);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let raw = r#"
            [topics.broken]
            resource = "/prices/SOL-USD/spot"
            refresh_interval_secs = 0
        "#;
        match CoinpulseConfig::from_toml_str(raw) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("broken")),
            other => panic!("Expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_rate_limits_keep_other_defaults() {
        let raw = r#"
            [rate_limits.price]
            window_ms = 1000
            max_requests = 3
        "#;
        let config = CoinpulseConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.rate_limits.len(), 3);
        assert_eq!(config.rate_limits["price"].max_requests, 3);
        assert_eq!(config.rate_limits[CLASS_STATIC].max_requests, 120);
        assert_eq!(config.rate_limits[CLASS_GENERAL].window_ms, 60_000);
    }

    #[test]
    fn test_rejects_zero_upstream_timeout() {
        let raw = r#"
            [upstream]
            timeout_secs = 0
        "#;
        match CoinpulseConfig::from_toml_str(raw) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("timeout")),
            other => panic!("Expected invalid config, got {:?}", other),
        }
    }
}
