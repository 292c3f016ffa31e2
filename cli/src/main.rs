//! stxindex — indexing sidecar binary.
//!
//! Usage:
//! ```bash
//! node-event-stream | stxindex
//! ```
//!
//! Reads newline-delimited JSON node block messages on stdin, decodes
//! them, and ingests them into the Postgres store configured through the
//! environment (`PG_*`, `NODE_ENV`, `STX_NETWORK`). Runs until stdin
//! closes or SIGINT.

use std::env;
use std::process;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stxindex_core::decoder::{decode_block_message, NodeBlockMessage};
use stxindex_ingest::{Config, Indexer, Notifier};
use stxindex_storage::{PostgresOptions, PostgresStore};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "version" | "--version" | "-V" => {
                println!("stxindex {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            "help" | "--help" | "-h" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                process::exit(1);
            }
        }
    }

    init_tracing();

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|err| {
        eprintln!("Failed to start runtime: {err}");
        process::exit(1);
    });
    if let Err(err) = runtime.block_on(run()) {
        error!(error = %err, "stxindex exited with error");
        process::exit(1);
    }
}

fn print_usage() {
    println!("stxindex {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe chain indexing sidecar\n");
    println!("USAGE:");
    println!("    node-event-stream | stxindex\n");
    println!("ENVIRONMENT:");
    println!("    PG_HOST, PG_PORT, PG_DATABASE, PG_USER, PG_PASSWORD, PG_SCHEMA");
    println!("    NODE_ENV     production | development | test");
    println!("    STX_NETWORK  mainnet | testnet");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let store = PostgresStore::connect_with_options(
        &config.pg.connection_url(),
        PostgresOptions {
            schema: config.pg.schema.clone(),
            ..PostgresOptions::default()
        },
    )
    .await?;

    let notifier = Arc::new(Notifier::new());
    let indexer = Indexer::with_options(store.clone(), notifier, config.indexer.clone());

    let (batch_tx, batch_rx) = mpsc::channel(64);
    let network = config.network;
    let feeder = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, closing input");
                    break;
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let msg: NodeBlockMessage = match serde_json::from_str(&line) {
                        Ok(msg) => msg,
                        Err(err) => {
                            error!(error = %err, "Malformed node message, dropping");
                            continue;
                        }
                    };
                    match decode_block_message(&msg, network) {
                        Ok(batch) => {
                            // The indexer has stopped; no point reading more.
                            if batch_tx.send(batch).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            error!(height = msg.block_height, error = %err, "Decode failed, dropping message");
                        }
                    }
                }
                Ok(None) => {
                    info!("Input stream closed");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "Failed reading input");
                    break;
                }
            }
        }
    });

    // The in-flight batch commits (or rolls back) before run() returns;
    // the notifier is drained inside it.
    let result = indexer.run(batch_rx).await;
    let _ = feeder.await;
    store.close().await;

    result.map_err(Into::into)
}
