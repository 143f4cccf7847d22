//! Audio Hub Server
//!
//! Admits clients over TCP and serves each one from a pool slot.
//! Usage: `audio-hub [config.toml]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_hub::{
    config::HubConfig,
    hub::{HubListener, HubPool},
    session::LoopbackFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Audio Hub");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(HubConfig::default_path);

    let config = match &config_path {
        Some(path) => HubConfig::load_or_default(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HubConfig::default(),
    };
    config.validate()?;

    tracing::info!(
        "Pool: {} slots, UDP ports {}..{}, handshake timeout {:?}",
        config.hub.max_clients,
        config.hub.base_udp_port,
        config.hub.base_udp_port as usize + config.hub.max_clients,
        config.hub.handshake_timeout()
    );

    let factory = Arc::new(LoopbackFactory::new(config.session.no_traffic_timeout()));
    let pool = HubPool::new(&config, factory, tokio::runtime::Handle::current())?;

    let bind_addr: SocketAddr = format!("{}:{}", config.hub.bind_address, config.hub.tcp_port)
        .parse()
        .context("invalid bind address")?;
    let listener = HubListener::bind(bind_addr, pool.clone()).await?;

    tokio::select! {
        result = listener.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down, stopping {} active sessions", pool.active_count());
        }
    }

    pool.stop_all();
    let drain_timeout = config.hub.handshake_timeout() + Duration::from_secs(2);
    if !pool.drain(drain_timeout).await {
        tracing::warn!("{} slots still busy at exit", pool.active_count());
    }

    Ok(())
}
