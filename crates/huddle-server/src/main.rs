//! # Huddle Server
//!
//! Realtime chat server: presence, typing indicators, group and private
//! rooms, read receipts, and reactions over WebSocket, with message
//! history over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory storage)
//! HUDDLE_JWT_SECRET=change-me huddle
//!
//! # Persist to SQLite
//! HUDDLE_JWT_SECRET=change-me HUDDLE_DB_PATH=/var/lib/huddle/huddle.db huddle
//!
//! # Run with environment variables
//! HUDDLE_PORT=8080 HUDDLE_HOST=0.0.0.0 huddle
//! ```
//!
//! A `huddle.toml` in the working directory, `/etc/huddle/`, or
//! `~/.config/huddle/` takes precedence over the environment.

mod api;
mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
