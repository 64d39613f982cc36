// ABOUTME: Server binary - loads configuration, wires resources, serves the HTTP API
// ABOUTME: Environment-only configuration with CLI overrides for port and database
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Chifa.ai

//! # Chifa Gateway Server Binary
//!
//! Starts the chat orchestration and credit metering service.

use anyhow::Result;
use chifa_gateway::{
    agent::AgentClient,
    auth::AuthManager,
    config::ServerConfig,
    database::Database,
    logging,
    resources::GatewayResources,
    routes,
};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "chifa-gateway")]
#[command(about = "Chifa Gateway - chat orchestration and credit metering")]
struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// Override database URL
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::from_env()?;
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }
    if let Some(database_url) = args.database_url {
        config.database.url = database_url;
    }

    logging::init_from_env()?;

    info!("Starting Chifa Gateway");
    info!("{}", config.summary());

    let database = Database::new(&config.database.url).await?;
    info!("Database initialized: {}", config.database.url);

    // Safe: expiry hours are small positive configuration values
    #[allow(clippy::cast_possible_wrap)]
    let auth_manager = AuthManager::new(
        config.auth.jwt_secret.as_bytes().to_vec(),
        config.auth.jwt_expiry_hours as i64,
    );

    let agent = AgentClient::new(config.agent.clone())?;

    let resources = Arc::new(GatewayResources::new(
        database,
        auth_manager,
        agent,
        config.streaming.to_streamer_config(),
        config.streaming.max_concurrent_streams,
    ));

    let app = routes::router(resources);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received");
}
