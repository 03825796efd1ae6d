//! `courier` — send stdin lines as acknowledged messages.
//!
//! Connects to a delivery backend, sends every line read from stdin as a
//! text message, and prints inbound messages to stdout. Delivery results and
//! connection changes go to stderr. On EOF, waits for outstanding messages,
//! disconnects, and prints the connection statistics as JSON.
//!
//! ```bash
//! cargo run --bin courier-relay &
//! echo "hello" | cargo run --bin courier -- --url ws://127.0.0.1:9000/ws
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing_appender::non_blocking::WorkerGuard;

use courier::config::{CliArgs, ClientConfig};
use courier::transport::websocket::WebSocketTransport;
use courier::{ConnectionState, ConnectionStats, Courier, MessageId, OutboundMessage};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());
    tracing::info!(url = %config.url, "courier starting");

    let transport = match WebSocketTransport::new(&config.url) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (courier, mut dispatch_errors) = match Courier::new(transport, config.courier.clone()) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    tokio::spawn(async move {
        while let Some(e) = dispatch_errors.recv().await {
            tracing::error!(error = %e, "handler failed");
        }
    });

    let outcome = run(&courier).await;
    courier.shutdown().await;
    tracing::info!("courier exiting");
    outcome
}

async fn run(courier: &Courier) -> ExitCode {
    let subscribed = async {
        courier
            .on_message(|m| {
                let body = m.payload.get("body").unwrap_or(&m.payload);
                match body.as_str() {
                    Some(text) => println!("{text}"),
                    None => println!("{body}"),
                }
                Ok(())
            })
            .await?;
        courier
            .on_connection_state_change(|change| {
                match &change.error {
                    Some(e) => eprintln!("[{}] {e}", change.current),
                    None => eprintln!("[{}]", change.current),
                }
                Ok(())
            })
            .await
    };
    if let Err(e) = subscribed.await {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = courier.connect().await {
        // Reconnection continues in the background; queued lines go out
        // once a connection is established.
        eprintln!("warning: {e}");
    }

    let mut receipts = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                let message = OutboundMessage::text(MessageId::generate(), line);
                match courier.submit(message).await {
                    Ok(receipt) => {
                        receipts.spawn(async move {
                            let id = receipt.id().clone();
                            (id, receipt.wait().await)
                        });
                    }
                    Err(e) => {
                        eprintln!("error: {e}");
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        }
    }

    let mut failures = 0usize;
    // Counters as they stood before a reset zeroed them.
    let mut final_stats: Option<ConnectionStats> = None;
    let mut state = courier.watch_state();
    if *state.borrow_and_update() == ConnectionState::Error {
        final_stats = courier.reset().await.ok();
    }
    loop {
        let joined = tokio::select! {
            joined = receipts.join_next() => match joined {
                Some(joined) => joined,
                None => break,
            },
            Ok(()) = state.changed() => {
                // Reconnection gave up; nothing queued can be delivered.
                if *state.borrow_and_update() == ConnectionState::Error {
                    match courier.reset().await {
                        Ok(before) => final_stats = Some(before),
                        Err(_) => break,
                    }
                }
                continue;
            }
        };
        match joined {
            Ok((id, Ok(ack))) => {
                tracing::info!(message_id = %id, latency_ms = ack.latency.as_millis(), "delivered");
            }
            Ok((id, Err(e))) => {
                failures += 1;
                eprintln!("failed {id}: {e}");
            }
            Err(e) => {
                failures += 1;
                tracing::error!(error = %e, "receipt task failed");
            }
        }
    }

    courier.disconnect().await;
    let stats = final_stats.unwrap_or_else(|| courier.stats());
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => eprintln!("{json}"),
        Err(e) => tracing::warn!(error = %e, "cannot render statistics"),
    }

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Initialize logging to stderr, or to a file if `file_path` is given.
///
/// A path without a usable file name falls back to stderr. Returns a
/// [`WorkerGuard`] for the file writer that must be held until shutdown to
/// flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(log_file_parts) else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        if let Some(path) = file_path {
            tracing::warn!(path = %path.display(), "log file path has no file name, logging to stderr");
        }
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Split a log file path into the directory and file name the appender wants.
fn log_file_parts(path: &Path) -> Option<(&Path, &str)> {
    let file_name = path.file_name()?.to_str()?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Some((dir, file_name))
}
