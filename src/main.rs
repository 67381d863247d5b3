// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use polka_dashboard_core::{
    api::{MarketDataClient, ReqwestTransport},
    chain::{ConnectionEvent, ConnectionManager, WsRpcConnector},
    config::load_config,
    utils::setup_logging,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "polka-dashboard", about = "Polkadot dashboard backend resilience core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the first healthy RPC endpoint and print chain info
    Connect,
    /// Fetch a token price through the cached, rate limited client
    Price {
        #[arg(long, default_value = "polkadot")]
        token: String,
        #[arg(long, default_value = "usd")]
        vs: String,
    },
    /// Fetch an explorer endpoint through its cached client
    Explorer {
        #[arg(long, default_value = "/scan/metadata")]
        path: String,
    },
    /// Stay connected, log connection events and poll the price until Ctrl-C
    Watch {
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config().context("Failed to load configuration")?;
    setup_logging(config.log_level_filter()).context("Failed to initialize logging")?;
    info!("🚀 Polkadot dashboard core starting...");
    config.validate_and_log();

    let connector = Arc::new(WsRpcConnector::new(config.rpc_required_methods.clone()));
    let manager = ConnectionManager::new(config.connection_config(), connector)?;
    let transport = Arc::new(ReqwestTransport::new()?);
    let prices = MarketDataClient::new(config.price_feed_upstream(), transport.clone());
    let explorer = MarketDataClient::new(config.explorer_upstream(), transport);
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Connect => {
            let handle = manager.connect().await?;
            let chain = handle.request("system_chain", json!([])).await?;
            let version = handle.request("state_getRuntimeVersion", json!([])).await?;
            info!(
                "✅ {} via {} (spec version {})",
                chain,
                handle.endpoint(),
                version.get("specVersion").unwrap_or(&json!(null))
            );
            manager.disconnect().await;
        }
        Command::Price { token, vs } => {
            let served = prices.token_price(&token, &vs, &cancel).await?;
            info!(
                "💰 {} = {} {} ({:?})",
                token, served.data, vs, served.served_from
            );
        }
        Command::Explorer { path } => {
            let served = explorer.get_json(&path, &[], &cancel).await?;
            info!("🔎 {} ({:?}): {}", path, served.served_from, served.data);
        }
        Command::Watch { interval_secs } => {
            watch(manager, prices, cancel, Duration::from_secs(interval_secs)).await?;
        }
    }

    Ok(())
}

async fn watch(
    manager: ConnectionManager,
    prices: MarketDataClient,
    cancel: CancellationToken,
    interval: Duration,
) -> Result<()> {
    let mut events = manager.subscribe();
    manager.connect().await?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, shutting down");
            shutdown.cancel();
        }
    });

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected { endpoint }) => info!("🔗 Connected to {}", endpoint),
                Ok(ConnectionEvent::Disconnected { endpoint }) => warn!("📴 Disconnected from {}", endpoint),
                Ok(ConnectionEvent::Error { endpoint, message }) => error!("❌ {}: {}", endpoint, message),
                Err(_) => {}
            },
            _ = ticker.tick() => {
                match prices.token_price("polkadot", "usd", &cancel).await {
                    Ok(served) => info!("💰 DOT = ${} ({:?})", served.data, served.served_from),
                    Err(e) if e.is_recoverable() => warn!("⚠️ Price unavailable: {}", e),
                    Err(e) => error!("❌ Price request failed: {}", e),
                }
                if let Some(stats) = prices.rate_limit_stats().await {
                    info!("📊 {}", stats);
                }
            }
        }
    }

    manager.disconnect().await;
    Ok(())
}
