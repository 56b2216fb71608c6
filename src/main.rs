//! Arbitrage engine entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use arb_engine::config::EngineConfig;
use arb_engine::engine::ArbEngine;
use arb_engine::signer::LocalSigner;
use arb_engine::transport::HttpConnection;

#[derive(Debug, Parser)]
#[command(name = "arb-engine", about = "On-chain DEX arbitrage engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "ARB_CONFIG", default_value = "config.toml")]
    config: String,

    /// Starting nonce for the trading wallet (queried off-chain otherwise)
    #[arg(long, env = "ARB_STARTING_NONCE", default_value_t = 0)]
    starting_nonce: u64,

    /// Log filter, e.g. "info" or "arb_engine=debug"
    #[arg(long, env = "ARB_LOG", default_value = "info")]
    log: String,

    /// Emit JSON log lines instead of human-readable output
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(Level::INFO.to_string()));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;
    info!(
        chain_id = config.chain_id,
        venues = config.venues.len(),
        "configuration loaded"
    );

    // Key material stays in the environment; the engine only ever sees the
    // signing oracles
    let trading_key =
        std::env::var("ARB_TRADING_KEY").context("ARB_TRADING_KEY not set")?;
    let auth_key = std::env::var("ARB_AUTH_KEY").context("ARB_AUTH_KEY not set")?;
    let trading_signer = Arc::new(LocalSigner::from_hex_key(&trading_key)?);
    let auth_signer = Arc::new(LocalSigner::from_hex_key(&auth_key)?);

    let conn = Arc::new(HttpConnection::new(Duration::from_secs(30))?);

    let engine = Arc::new(ArbEngine::new(
        config,
        conn,
        trading_signer,
        auth_signer,
        cli.starting_nonce,
        None,
    )?);

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    engine.run().await?;
    info!("engine stopped");
    Ok(())
}
