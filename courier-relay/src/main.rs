//! `courier-relay` -- reference delivery backend.
//!
//! An axum WebSocket server that acknowledges every message frame, fans it
//! out to the other connected clients, and answers heartbeat probes.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin courier-relay
//!
//! # Run on custom address
//! cargo run --bin courier-relay -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! COURIER_RELAY_ADDR=127.0.0.1:8080 cargo run --bin courier-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use courier_relay::config::{RelayCliArgs, RelayConfig};
use courier_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting courier relay");

    let state = Arc::new(RelayState::with_config(config.max_payload_size));

    match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, mut handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            tokio::select! {
                joined = &mut handle => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down, closing connections");
                    state.close_all_connections().await;
                    handle.abort();
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
