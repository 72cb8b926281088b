//! Acceler SNI proxy
//!
//! TLS passthrough proxy that routes on the ClientHello's SNI hostname.
//!
//! This service:
//! - Accepts TCP connections on the configured listen URI
//! - Reads the TLS ClientHello without terminating TLS
//! - Dials the SNI hostname on port 443, directly or through an HTTP CONNECT proxy
//! - Relays the encrypted stream in both directions

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use acceler_sni::config::{Cli, Command, ProxyConfig};
use acceler_sni::proxy::{user_agent, Dialer, Listener};

/// Product name sent in the CONNECT User-Agent.
const PRODUCT_NAME: &str = "Acceler";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sni(args) => run_sni_proxy(ProxyConfig::from(args)).await,
    }
}

async fn run_sni_proxy(config: ProxyConfig) -> Result<()> {
    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Acceler SNI proxy");
    info!(
        listen = %config.listen,
        upstream_proxy = ?config.upstream_proxy.as_ref().map(ToString::to_string),
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let bind_addr = config
        .bind_addr()
        .await
        .with_context(|| format!("Failed to resolve listen address {}", config.listen))?;

    let dialer = Dialer::new(
        config.dialer_config(user_agent(PRODUCT_NAME, env!("CARGO_PKG_VERSION"))),
    );

    let listener = Listener::bind(config.listener_config(bind_addr), dialer)
        .await
        .with_context(|| format!("Failed to bind listener on {bind_addr}"))?;

    Arc::new(listener).run().await.context("Listener failed")
}
