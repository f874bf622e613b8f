use crate::hub::BroadcastHub;
use chrono::{DateTime, Utc};
use coinpulse_core::CoinpulseConfig;
use coinpulse_data::Cache;
use std::sync::Arc;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub hub: BroadcastHub,
    pub cache: Arc<Cache>,
    pub config: Arc<CoinpulseConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(hub: BroadcastHub, cache: Arc<Cache>, config: Arc<CoinpulseConfig>) -> Self {
        Self {
            hub,
            cache,
            config,
            started_at: Utc::now(),
        }
    }
}
