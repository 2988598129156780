//! listingsync - run listing queries through the coalescing cache
//!
//! Issues one query from several concurrent callers (or watches it) against
//! either the built-in sample store or a remote document service, then prints
//! the documents and the coordinator's counters as JSON.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use listingsync::cli::{Cli, Command};
use listingsync::client::ListingClient;
use listingsync::coordinator::Coordinator;
use listingsync::store::{DataSource, HttpStore, MemoryStore};

/// Sets up log output on stderr, filtered by `RUST_LOG` (default: warn)
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_source(cli: &Cli) -> Arc<dyn DataSource> {
    match (&cli.source, &cli.command) {
        (Some(url), _) => Arc::new(HttpStore::new(url.clone())),
        (None, Command::Query { latency_ms, .. }) => Arc::new(
            MemoryStore::with_sample_data().with_latency(Duration::from_millis(*latency_ms)),
        ),
        (None, Command::Watch { .. }) => Arc::new(MemoryStore::with_sample_data()),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.coordinator_config()?;
    info!(ttl = ?config.ttl, max_entries = ?config.max_entries, "Starting coordinator");

    let coordinator = Arc::new(Coordinator::new(&config));
    let client = ListingClient::new(build_source(&cli), Arc::clone(&coordinator));
    let query = cli.command.query_key();

    match &cli.command {
        Command::Query { concurrency, .. } => {
            let callers = (*concurrency).max(1);
            let results = join_all((0..callers).map(|_| client.fetch(&query))).await;

            let mut documents = None;
            for result in results {
                documents = Some(result?);
            }

            let output = json!({
                "key": query.cache_key(),
                "documents": documents.map(|docs| docs.as_ref().clone()).unwrap_or_default(),
                "stats": client.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Watch { updates, .. } => {
            let (tx, mut rx) = mpsc::channel(16);
            let key = client.watch(&query, tx)?;
            info!(listener = %key, "Watching");

            let mut received = 0;
            while received < *updates {
                match rx.recv().await {
                    Some(snapshot) => {
                        received += 1;
                        let output = json!({ "key": key.as_str(), "documents": snapshot });
                        println!("{}", serde_json::to_string(&output)?);
                    }
                    None => break,
                }
            }
        }
    }

    client.sign_out();
    Ok(())
}
