use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tracing::{error, info};

use option_chain_ingest::config::{PipelineConfig, StoreConfig, StoreTarget};
use option_chain_ingest::data::{ProviderSession, QuoteSource};
use option_chain_ingest::logging::setup_logging;
use option_chain_ingest::pipeline::{Orchestrator, StatusSnapshot};
use option_chain_ingest::storage::{DocumentStore, MemoryStore, QuoteWriter, SqliteStore};

/// Opens the document store named by the configuration.
///
/// # Arguments
/// * `config`: store target and collection naming
///
/// # Errors
/// Returns an error if the database cannot be opened or does not answer a ping.
async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match &config.target {
        StoreTarget::Sqlite(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("failed to open store at {}", path.display()))?,
        ),
        StoreTarget::Memory => {
            info!("using volatile in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    store.ping().await.context("store did not answer ping")?;
    Ok(store)
}

/// Prints the final per-symbol status once every pipeline has stopped.
fn print_status_table(statuses: &[StatusSnapshot]) {
    println!("\nIngestion Summary:");
    println!(
        "{:<12} {:>7} {:>9} {:>10} {:>10} {:>8} {:>9}  {}",
        "Symbol", "Cycles", "Success", "Accepted", "Rejected", "Dropped", "Degraded", "Last Success"
    );
    for status in statuses {
        let last_success = status
            .last_success_time
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<12} {:>7} {:>8.1}% {:>10} {:>10} {:>8} {:>9}  {}",
            status.symbol,
            status.total_cycles,
            status.success_rate * 100.0,
            status.totals_accepted,
            status.totals_rejected,
            status.dropped_rows,
            if status.degraded { "yes" } else { "no" },
            last_success
        );
        println!(
            "{:<12} calls {}/{} puts {}/{} (accepted/rejected)",
            "", status.calls.accepted, status.calls.rejected, status.puts.accepted, status.puts.rejected
        );
        if let Some(err) = &status.last_error {
            println!("{:<12} last error [{}]: {}", "", err.kind, err.message);
        }
    }
}

/// Entry point for the option-chain ingestion service.
///
/// 1. Load `.env` and read the configuration
/// 2. Initialize logging
/// 3. Open the store and declare the dedup indexes
/// 4. Start one pipeline per symbol, each with its own provider session
/// 5. Run until Ctrl-C, then stop at the next cycle boundary and print a
///    summary
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    setup_logging(&config.logging)?;
    info!(
        symbols = ?config.symbols,
        interval_secs = config.schedule.fetch_interval.as_secs(),
        store = ?config.store.target,
        "starting option chain ingestion"
    );

    let store = open_store(&config.store).await.map_err(|err| {
        error!("store unavailable: {:#}", err);
        err
    })?;
    let writer = QuoteWriter::new(store, config.store.clone());
    writer
        .ensure_collections(&config.symbols)
        .await
        .context("failed to declare dedup indexes")?;

    let sources: Vec<(String, Arc<dyn QuoteSource>)> = config
        .symbols
        .iter()
        .map(|symbol| {
            let session: Arc<dyn QuoteSource> =
                Arc::new(ProviderSession::new(config.provider.clone()));
            (symbol.clone(), session)
        })
        .collect();

    let handle = Orchestrator::new(&config, writer).spawn(sources);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested, finishing in-flight cycles");

    let statuses = handle.stop().await;
    print_status_table(&statuses);

    Ok(())
}
