use async_trait::async_trait;
use coinpulse_api::state::AppState;
use coinpulse_api::{build_router, BroadcastHub};
use coinpulse_client::{ClientState, SyncClient};
use coinpulse_core::*;
use coinpulse_data::{Cache, RateLimiter, UpstreamClient};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct CountingUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl Upstream for CountingUpstream {
    async fn get(&self, _resource: &str, _params: &Params) -> Result<Value, SyncError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "data": { "base": "SOL", "currency": "USD", "amount": format!("14{}.00", n) } }))
    }
}

/// Start a hub on a loopback port. Returns its ws URL.
async fn start_hub(upstream: Arc<CountingUpstream>, ttl_secs: u64, refresh_secs: u64) -> String {
    let mut config = CoinpulseConfig::default();
    config.resources = vec![ResourceConfig {
        prefix: "/prices".to_string(),
        class: CLASS_PRICE.to_string(),
        ttl_secs,
    }];
    config.topics.clear();
    config.topics.insert(
        "solana-price".to_string(),
        TopicConfig {
            resource: "/prices/SOL-USD/spot".to_string(),
            params: Params::new(),
            refresh_interval_secs: refresh_secs,
        },
    );
    let config = Arc::new(config);

    let cache = Arc::new(Cache::new());
    let client = UpstreamClient::new(
        upstream,
        cache.clone(),
        Arc::new(RateLimiter::new(&config.rate_limits)),
        config.clone(),
    );
    let hub = BroadcastHub::new(Arc::new(client), config.clone());
    let app = build_router(Arc::new(AppState::new(hub, cache, config)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{}/ws", addr)
}

fn client_config(url: String) -> ClientConfig {
    ClientConfig {
        url,
        max_retries: 2,
        reconnect_delay_ms: 100,
        stale_after_secs: 30,
        heartbeat_timeout_secs: 60,
    }
}

#[tokio::test]
async fn test_subscribe_receives_initial_data_then_cached_update() {
    let upstream = Arc::new(CountingUpstream {
        calls: AtomicUsize::new(0),
    });
    // The cache outlives the poll interval, so the tick is served from cache.
    let url = start_hub(upstream.clone(), 30, 1).await;

    let client = SyncClient::websocket(client_config(url));
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    for kind in [MessageType::InitialData, MessageType::Update] {
        let tx = tx.clone();
        client.subscribe(kind, move |msg| {
            let _ = tx.send(msg.clone());
        });
    }

    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    client.subscribe_topic("solana-price");

    let initial = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(initial.kind, MessageType::InitialData);
    assert_eq!(initial.topic, "solana-price");
    assert_eq!(initial.data["data"]["amount"], "141.00");

    let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.kind, MessageType::Update);
    assert_eq!(update.data, initial.data);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert!(!client.is_stale());

    client.disconnect();
}

#[tokio::test]
async fn test_unknown_topic_reports_error() {
    let upstream = Arc::new(CountingUpstream {
        calls: AtomicUsize::new(0),
    });
    let url = start_hub(upstream.clone(), 10, 10).await;

    let client = SyncClient::websocket(client_config(url));
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    client.subscribe(MessageType::Error, move |msg| {
        let _ = tx.send(msg.clone());
    });

    client.connect().await.unwrap();
    client.subscribe_topic("dogecoin-price");

    let err = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err.topic, "dogecoin-price");
    assert_eq!(err.data["error"], "unknown_topic");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

    client.disconnect();
}
