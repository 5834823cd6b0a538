// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote Action Proxy - OpenWhisk action server
//!
//! Accepts `/init` and `/run` from the invoker and executes the action on a
//! rented remote node over SSH.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use remote_action_proxy::config::Config;
use remote_action_proxy::{ActionHandlerState, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (reported once logging is up)
    let dotenv = dotenvy::dotenv();

    let debug = std::env::var("OW_DEBUG").is_ok_and(|v| !v.is_empty());
    let default_filter = if debug {
        "remote_action_proxy=debug,tower_http=debug"
    } else {
        "remote_action_proxy=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        action_dir = %config.action_dir.display(),
        provider_url = %config.provider_url,
        remote_user = %config.remote_user,
        debug = config.debug,
        "Starting Remote Action Proxy"
    );

    let bind_addr = config.bind_addr;
    let state = Arc::new(ActionHandlerState::from_config(config)?);
    info!(
        connector = state.connector.connector_type(),
        "Remote connector initialized"
    );

    let listener = TcpListener::bind(bind_addr).await?;
    serve(listener, state, shutdown_signal()).await?;

    info!("Remote Action Proxy shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
