use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coinpulse_client::SyncClient;
use coinpulse_core::{CoinpulseConfig, MessageType, Params};
use coinpulse_data::{Cache, HttpUpstream, RateLimiter, UpstreamClient};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "coinpulse")]
#[command(about = "Real-time crypto market data: cached upstream polling fanned out over WebSocket")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Path to a TOML config file
    #[arg(short, long, env = "COINPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream API base URL (overrides the config file)
    #[arg(long, env = "COINPULSE_UPSTREAM_URL")]
    upstream_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server
    Serve {
        /// Bind address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Connect to a running server and print pushes for the given topics
    Watch {
        /// Topics to subscribe to (e.g. "solana-price")
        #[arg(required = true)]
        topics: Vec<String>,

        /// Server WebSocket URL (overrides the config file)
        #[arg(short, long, env = "COINPULSE_URL")]
        url: Option<String>,
    },

    /// Fetch one upstream resource through the cache and rate limiter
    Fetch {
        /// Resource path (e.g. "/prices/BTC-USD/spot")
        resource: String,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// List configured topics
    Topics,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn apply_global_overrides(cli: &Cli, config: &mut CoinpulseConfig) {
    if let Some(url) = &cli.upstream_url {
        config.upstream.base_url = url.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }

    let mut config = match &cli.config {
        Some(path) => CoinpulseConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CoinpulseConfig::default(),
    };
    apply_global_overrides(&cli, &mut config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            coinpulse_api::start_server(Arc::new(config)).await?;
        }
        Commands::Watch { topics, url } => {
            if let Some(url) = url {
                config.client.url = url;
            }
            watch(config, topics).await?;
        }
        Commands::Fetch { resource, params } => {
            fetch(config, resource, params).await?;
        }
        Commands::Topics => {
            println!("Configured topics:");
            for (name, topic) in &config.topics {
                let policy = config.resource_policy(&topic.resource);
                println!(
                    "  {:<16} {:<28} every {:>3}s  (class {}, ttl {}s)",
                    name,
                    topic.resource,
                    topic.refresh_interval_secs,
                    policy.class,
                    policy.ttl.as_secs()
                );
            }
        }
    }

    Ok(())
}

async fn watch(config: CoinpulseConfig, topics: Vec<String>) -> Result<()> {
    let client = SyncClient::websocket(config.client.clone());

    for kind in [MessageType::InitialData, MessageType::Update, MessageType::Error] {
        client.subscribe(kind, move |msg| {
            let data = serde_json::to_string(&msg.data).unwrap_or_default();
            println!("{:<12} {:<16} {}", msg.kind.as_str(), msg.topic, data);
        });
    }

    for topic in topics {
        client.subscribe_topic(topic);
    }
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.client.url))?;

    let mut state = client.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!(state = %current, "Connection state changed");
                if current == coinpulse_client::ClientState::Failed {
                    anyhow::bail!("gave up reconnecting to {}", config.client.url);
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}

async fn fetch(config: CoinpulseConfig, resource: String, params: Vec<(String, String)>) -> Result<()> {
    let config = Arc::new(config);
    let upstream = HttpUpstream::new(&config.upstream)?;
    let client = UpstreamClient::new(
        Arc::new(upstream),
        Arc::new(Cache::new()),
        Arc::new(RateLimiter::new(&config.rate_limits)),
        config.clone(),
    );

    let params: Params = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let value = client.fetch(&resource, &params).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
